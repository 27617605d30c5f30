// SPDX-License-Identifier: Apache-2.0

use super::{diffexp_available, CachePolicy, OpContext, OpOutput};
use cxg_codec::{finite_json_values, Binning, Column, Matrix};
use cxg_core::{query_fingerprint, CxgError};
use cxg_query::{
    filter_from_query, resolve_filter, summarize_var as summarize, DiffexEngine, DiffexRequest,
    DiffexResult, DiffexRow, Filter, SummaryMethod,
};
use cxg_store::{mask_indices, Axis};
use serde_json::{json, Value};
use std::sync::atomic::AtomicBool;

/// Expression values for the selected genes, one column per gene with the
/// gene positions as the column index. Only var filters are accepted.
pub fn data_var(ctx: OpContext<'_>, filter: &Filter, nbins: Option<u32>) -> Result<OpOutput, CxgError> {
    let adaptor = ctx.adaptor;
    if filter.var.is_none() && filter.obs.is_none() {
        return Err(CxgError::filter("data/var requires a var filter"));
    }
    let selection = resolve_filter(adaptor, filter, &[Axis::Var])?;
    let (n_obs, n_var) = adaptor.shape();
    let cols = mask_indices(selection.mask(Axis::Var), n_var, "var")?;
    ctx.config.limits.query.check_columns(cols.len())?;
    let rows: Vec<usize> = (0..n_obs).collect();
    let block = adaptor.x_slice_indices(&rows, &cols)?;
    let binning = nbins
        .map(Binning::new)
        .transpose()
        .map_err(|e| CxgError::filter(e.to_string()))?;
    let mut columns = Vec::with_capacity(cols.len());
    for c in 0..block.n_cols {
        let column = Column::Float32(block.column(c));
        columns.push(match &binning {
            Some(b) => b.apply(column)?,
            None => column,
        });
    }
    let index = cols
        .iter()
        .map(|c| u32::try_from(*c).map_err(|_| CxgError::exceeds_limit("var index overflow")))
        .collect::<Result<Vec<u32>, _>>()?;
    let matrix = Matrix::new(n_obs, columns).with_col_index(Column::UInt32(index));
    OpOutput::matrix(
        &matrix,
        CachePolicy::Immutable,
        ctx.config.limits.response_max_bytes,
    )
}

fn topn_mode(body: &Value) -> Result<(), CxgError> {
    match body.get("mode").and_then(Value::as_str) {
        None | Some("topN") => Ok(()),
        Some("varFilter") => Err(CxgError::unsupported("diffexp varFilter mode is not implemented")),
        Some(other) => Err(CxgError::filter(format!("unknown diffexp mode {other}"))),
    }
}

fn top_n(ctx: OpContext<'_>, body: &Value) -> Result<usize, CxgError> {
    let limits = &ctx.config.limits.query;
    let count = match body.get("count") {
        None | Some(Value::Null) => limits.diffexp_top_n,
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| CxgError::filter("count must be a positive integer"))?,
    };
    limits.check_top_n(count)?;
    Ok(count)
}

fn run_diffex(
    ctx: OpContext<'_>,
    engine: &DiffexEngine,
    set_a: &[usize],
    set_b: &[usize],
    top_n: usize,
    cancel: &AtomicBool,
) -> Result<DiffexResult, CxgError> {
    let (n_obs, _) = ctx.adaptor.shape();
    if !diffexp_available(ctx.config, n_obs) {
        return Err(CxgError::unsupported("diffexp is disabled for this dataset"));
    }
    let limits = &ctx.config.limits.query;
    limits.check_cell_count(set_a.len(), set_b.len())?;
    let x = ctx.adaptor.x()?;
    engine.run(
        &x,
        ctx.adaptor.approx_distribution(),
        &DiffexRequest {
            set_a,
            set_b,
            top_n,
            lfc_cutoff: limits.diffexp_lfc_cutoff,
        },
        cancel,
    )
}

fn obs_set(ctx: OpContext<'_>, body: &Value, key: &str) -> Result<Vec<usize>, CxgError> {
    let raw = body
        .get(key)
        .and_then(|s| s.get("filter"))
        .cloned()
        .ok_or_else(|| CxgError::filter(format!("{key} requires a filter")))?;
    let filter = Filter::from_json(raw)?;
    if filter.var.is_some() {
        return Err(CxgError::filter(format!(
            "{key}: var filters are not supported by diffexp"
        )));
    }
    let selection = resolve_filter(ctx.adaptor, &filter, &[Axis::Obs])?;
    Ok(mask_indices(selection.mask(Axis::Obs), ctx.adaptor.shape().0, "obs")?)
}

fn json_rows(rows: &[DiffexRow]) -> Result<Vec<Value>, CxgError> {
    rows.iter()
        .map(|r| -> Result<Value, CxgError> {
            let mut row = vec![Value::from(r.var_index)];
            row.extend(finite_json_values(
                &[r.log_fold_change, r.p_value, r.p_value_adj],
                "diffexp row",
            )?);
            Ok(Value::Array(row))
        })
        .collect()
}

/// Welch's t-test between two filtered cell sets. Rows are
/// `[varIndex, logFoldChange, pValue, pValueAdj]`.
pub fn diffexp_obs(
    ctx: OpContext<'_>,
    engine: &DiffexEngine,
    body: &Value,
    cancel: &AtomicBool,
) -> Result<OpOutput, CxgError> {
    topn_mode(body)?;
    let count = top_n(ctx, body)?;
    let set_a = obs_set(ctx, body, "set1")?;
    let set_b = obs_set(ctx, body, "set2")?;
    let result = run_diffex(ctx, engine, &set_a, &set_b, count, cancel)?;
    OpOutput::json(
        &json!({
            "positive": json_rows(&result.positive)?,
            "negative": json_rows(&result.negative)?,
        }),
        CachePolicy::NoStore,
    )
}

fn index_set(body: &Value, key: &str) -> Result<Vec<usize>, CxgError> {
    let items = body
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| CxgError::filter(format!("{key} must be a list of obs indices")))?;
    let mut set = items
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| CxgError::filter(format!("{key} holds a non-index value {v}")))
        })
        .collect::<Result<Vec<usize>, _>>()?;
    set.sort_unstable();
    set.dedup();
    Ok(set)
}

/// Diffex over explicit obs index lists, answered as an encoded matrix with
/// a `direction` column telling positive rows from negative ones.
pub fn diffexp_obs2(
    ctx: OpContext<'_>,
    engine: &DiffexEngine,
    body: &Value,
    cancel: &AtomicBool,
) -> Result<OpOutput, CxgError> {
    topn_mode(body)?;
    let count = top_n(ctx, body)?;
    let set_a = index_set(body, "set1")?;
    let set_b = index_set(body, "set2")?;
    let result = run_diffex(ctx, engine, &set_a, &set_b, count, cancel)?;

    let rows: Vec<(&DiffexRow, u32)> = result
        .positive
        .iter()
        .map(|r| (r, 0))
        .chain(result.negative.iter().map(|r| (r, 1)))
        .collect();
    let var_index = rows
        .iter()
        .map(|(r, _)| i32::try_from(r.var_index).map_err(|_| CxgError::compute("var index overflow")))
        .collect::<Result<Vec<i32>, _>>()?;
    let float = |f: fn(&DiffexRow) -> f64| {
        Column::Float32(rows.iter().map(|(r, _)| f(r) as f32).collect())
    };
    let matrix = Matrix::new(
        rows.len(),
        vec![
            Column::Int32(var_index),
            float(|r| r.log_fold_change),
            float(|r| r.p_value),
            float(|r| r.p_value_adj),
            Column::Categorical {
                codes: rows.iter().map(|(_, d)| *d).collect(),
                categories: vec!["positive".to_string(), "negative".to_string()],
            },
        ],
    )
    .with_col_index(Column::Strings(
        ["varIndex", "logFoldChange", "pValue", "pValueAdj", "direction"]
            .iter()
            .map(ToString::to_string)
            .collect(),
    ));
    OpOutput::matrix(&matrix, CachePolicy::NoStore, ctx.config.limits.response_max_bytes)
}

/// Per-cell summary of the genes selected by `var:` parameters.
///
/// The result column is named by the SHA-1 of the canonical query without
/// `key`; a supplied `key` must equal it.
pub fn summarize_var(
    ctx: OpContext<'_>,
    pairs: &[(String, String)],
    cache: CachePolicy,
) -> Result<OpOutput, CxgError> {
    let mut method = SummaryMethod::Mean;
    let mut key = None;
    for (k, v) in pairs {
        match k.as_str() {
            "method" => method = v.parse()?,
            "key" => key = Some(v.as_str()),
            _ => {}
        }
    }
    let hashed: Vec<&(String, String)> = pairs.iter().filter(|(k, _)| k != "key").collect();
    let hashed: Vec<(&str, &str)> = hashed.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let query_hash = query_fingerprint(&hashed);
    if let Some(key) = key {
        if key != query_hash {
            return Err(CxgError::filter("query key did not match the query"));
        }
    }
    let filter = filter_from_query(pairs)?;
    let selection = resolve_filter(ctx.adaptor, &filter, &[Axis::Var])?;
    let values = summarize(ctx.adaptor, method, selection.mask(Axis::Var))?;
    let matrix = Matrix::new(values.len(), vec![Column::Float32(values)])
        .with_col_index(Column::Strings(vec![query_hash]));
    OpOutput::matrix(&matrix, cache, ctx.config.limits.response_max_bytes)
}
