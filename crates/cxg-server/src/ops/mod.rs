// SPDX-License-Identifier: Apache-2.0

//! Request operations over one opened dataset.
//!
//! Every operation is synchronous and runs on a blocking thread while the
//! caller holds a reader lease on the dataset handle.

mod compute;
mod dataset;

pub use compute::{data_var, diffexp_obs, diffexp_obs2, summarize_var};
pub use dataset::{
    annotations, colors, config, dataset_metadata, genesets, layout_obs, s3_uri, schema,
};

use crate::config::ServerConfig;
use crate::locator::ResolvedLocation;
use cxg_codec::{encode_matrix, Matrix};
use cxg_core::CxgError;
use cxg_store::CxgAdaptor;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Long-lived and content-addressed by an ETag.
    Immutable,
    NoStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Json,
    Matrix,
}

impl Media {
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Matrix => cxg_codec::MEDIA_TYPE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutput {
    pub body: Vec<u8>,
    pub media: Media,
    pub cache: CachePolicy,
}

impl OpOutput {
    pub fn json<T: Serialize>(value: &T, cache: CachePolicy) -> Result<Self, CxgError> {
        Ok(Self {
            body: serde_json::to_vec(value)?,
            media: Media::Json,
            cache,
        })
    }

    pub fn matrix(
        matrix: &Matrix,
        cache: CachePolicy,
        max_bytes: Option<usize>,
    ) -> Result<Self, CxgError> {
        let body = encode_matrix(matrix)?;
        if let Some(max) = max_bytes {
            if body.len() > max {
                return Err(CxgError::exceeds_limit(format!(
                    "response of {} bytes exceeds limit of {max}",
                    body.len()
                )));
            }
        }
        Ok(Self {
            body,
            media: Media::Matrix,
            cache,
        })
    }
}

/// Everything an operation may read.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    pub adaptor: &'a CxgAdaptor,
    pub config: &'a ServerConfig,
    pub location: &'a ResolvedLocation,
}

/// Diffex is offered unless disabled outright or, with
/// `disable_diffexp_for_large`, the dataset has more cells than the limit.
#[must_use]
pub fn diffexp_available(config: &ServerConfig, n_obs: usize) -> bool {
    if !config.features.diffexp {
        return false;
    }
    !(config.features.disable_diffexp_for_large
        && config
            .limits
            .query
            .diffexp_cellcount_max
            .is_some_and(|max| n_obs > max))
}

/// Requested names in first-seen order without duplicates, or `all` when
/// none were requested. Explicit requests count against the column limit.
pub(crate) fn requested_names(
    config: &ServerConfig,
    requested: &[String],
    all: impl FnOnce() -> Vec<String>,
) -> Result<Vec<String>, CxgError> {
    if requested.is_empty() {
        return Ok(all());
    }
    let mut names: Vec<String> = Vec::with_capacity(requested.len());
    for name in requested {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    config.limits.query.check_columns(names.len())?;
    Ok(names)
}
