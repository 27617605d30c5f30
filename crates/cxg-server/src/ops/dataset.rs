// SPDX-License-Identifier: Apache-2.0

use super::{diffexp_available, requested_names, CachePolicy, OpContext, OpOutput};
use cxg_codec::{Column, Matrix};
use cxg_core::CxgError;
use cxg_query::normalize_embedding;
use cxg_store::Axis;
use serde_json::{json, Map, Value};

pub fn schema(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    let schema = ctx.adaptor.schema()?;
    OpOutput::json(&json!({ "schema": &*schema }), CachePolicy::Immutable)
}

/// Server and dataset parameters for the client. Secrets and store
/// locations are never included.
pub fn config(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    let (n_obs, _) = ctx.adaptor.shape();
    let cfg = ctx.config;
    let diffexp = diffexp_available(cfg, n_obs);
    let features = json!([
        {"method": "POST", "path": "diffexp/obs", "available": diffexp},
        {"method": "POST", "path": "diffexp/obs2", "available": diffexp},
        {"method": "GET", "path": "summarize/var", "available": true},
        {"method": "POST", "path": "summarize/var", "available": true},
        {"method": "GET", "path": "layout/obs", "available": true},
        {"method": "GET", "path": "genesets", "available": true},
        {"method": "PUT", "path": "genesets", "available": !cfg.features.genesets_readonly},
        {"method": "PUT", "path": "annotations/obs", "available": cfg.features.user_annotations},
    ]);
    let mut body = json!({
        "config": {
            "features": features,
            "displayNames": {
                "engine": format!("cxg-server {}", env!("CARGO_PKG_VERSION")),
                "dataset": ctx.adaptor.title(),
            },
            "parameters": {
                "max-category-items": cfg.presentation.max_categories,
                "disable-diffexp": !diffexp,
                "diffexp_lfc_cutoff": cfg.limits.query.diffexp_lfc_cutoff,
                "annotations": cfg.features.user_annotations,
                "custom_colors": cfg.features.custom_colors,
                "X_approximate_distribution": ctx.adaptor.approx_distribution().as_str(),
            },
            "limits": {
                "column_request_max": cfg.limits.query.column_request_max,
                "diffexp_cellcount_max": cfg.limits.query.diffexp_cellcount_max,
            },
        }
    });
    if let (Some(corpora), Some(config)) = (ctx.adaptor.corpora(), body.get_mut("config")) {
        if let Some(obj) = config.as_object_mut() {
            obj.insert("corpora_props".to_string(), corpora.clone());
        }
    }
    OpOutput::json(&body, CachePolicy::NoStore)
}

/// Annotation columns of one axis. Obs responses are uncacheable when any
/// obs column is user-writable.
pub fn annotations(ctx: OpContext<'_>, axis: Axis, requested: &[String]) -> Result<OpOutput, CxgError> {
    let adaptor = ctx.adaptor;
    let names = requested_names(ctx.config, requested, || match axis {
        Axis::Obs => adaptor.obs_keys(),
        Axis::Var => adaptor.var_keys(),
    })?;
    if let Some(unknown) = names.iter().find(|n| !adaptor.has_column(axis, n)) {
        return Err(CxgError::filter(format!(
            "unknown {} annotation {unknown}",
            axis.as_str()
        )));
    }
    let columns = names
        .iter()
        .map(|name| adaptor.query(axis, name).map(|c| (*c).clone()))
        .collect::<Result<Vec<Column>, _>>()?;
    let n_rows = match axis {
        Axis::Obs => adaptor.shape().0,
        Axis::Var => adaptor.shape().1,
    };
    let cache = if axis == Axis::Obs && adaptor.schema()?.has_writable_obs() {
        CachePolicy::NoStore
    } else {
        CachePolicy::Immutable
    };
    let matrix = Matrix::new(n_rows, columns).with_col_index(Column::Strings(names));
    OpOutput::matrix(&matrix, cache, ctx.config.limits.response_max_bytes)
}

/// Embeddings normalized into the unit square, two columns per embedding
/// named `<name>_0` and `<name>_1`.
pub fn layout_obs(ctx: OpContext<'_>, requested: &[String]) -> Result<OpOutput, CxgError> {
    let adaptor = ctx.adaptor;
    let names = requested_names(ctx.config, requested, || adaptor.embedding_names().to_vec())?;
    if let Some(unknown) = names
        .iter()
        .find(|n| !adaptor.embedding_names().contains(n))
    {
        return Err(CxgError::filter(format!("unknown layout {unknown}")));
    }
    let mut labels = Vec::with_capacity(names.len() * 2);
    let mut columns = Vec::with_capacity(names.len() * 2);
    for name in &names {
        let mut dims = adaptor.embedding(name, 2)?;
        normalize_embedding(&mut dims);
        for (d, values) in dims.into_iter().enumerate() {
            labels.push(format!("{name}_{d}"));
            columns.push(Column::Float32(values));
        }
    }
    let matrix = Matrix::new(adaptor.shape().0, columns).with_col_index(Column::Strings(labels));
    OpOutput::matrix(
        &matrix,
        CachePolicy::Immutable,
        ctx.config.limits.response_max_bytes,
    )
}

pub fn colors(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    if !ctx.config.features.custom_colors {
        return OpOutput::json(&Value::Object(Map::new()), CachePolicy::Immutable);
    }
    OpOutput::json(&ctx.adaptor.colors(), CachePolicy::Immutable)
}

pub fn genesets(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    let genesets = ctx.adaptor.genesets()?;
    let cache = if ctx.config.features.genesets_readonly {
        CachePolicy::Immutable
    } else {
        CachePolicy::NoStore
    };
    OpOutput::json(&json!({ "genesets": genesets, "tid": 0 }), cache)
}

pub fn dataset_metadata(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    let location = ctx.location;
    let mut metadata = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            metadata.insert(key.to_string(), v);
        }
    };
    put("dataset_id", location.dataset_id.clone().map(Value::String));
    put("collection_id", location.collection_id.clone().map(Value::String));
    put(
        "collection_visibility",
        location.collection_visibility.clone().map(Value::String),
    );
    put("title", Some(Value::String(ctx.adaptor.title())));
    put("about", ctx.adaptor.about().map(|a| Value::String(a.to_string())));
    put("corpora", ctx.adaptor.corpora().cloned());
    OpOutput::json(&json!({ "metadata": metadata }), CachePolicy::NoStore)
}

pub fn s3_uri(ctx: OpContext<'_>) -> Result<OpOutput, CxgError> {
    OpOutput::json(&ctx.location.store_uri, CachePolicy::NoStore)
}
