// SPDX-License-Identifier: Apache-2.0

//! Store URI dispatch and path-normalizing joins.

use crate::error::{StoreError, StoreErrorCode};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Local(PathBuf),
    Http(String),
    /// `s3://bucket/key`, mapped onto the configured object-store endpoint.
    ObjectStore { bucket: String, key: String },
}

pub fn parse_store_uri(uri: &str) -> Result<StoreLocation, StoreError> {
    if uri.is_empty() {
        return Err(StoreError::new(
            StoreErrorCode::Configuration,
            "empty store uri",
        ));
    }
    if let Some(rest) = uri.strip_prefix("file://") {
        return Ok(StoreLocation::Local(PathBuf::from(rest)));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Ok(StoreLocation::Http(uri.trim_end_matches('/').to_string()));
    }
    if let Some(rest) = uri.strip_prefix("s3://") {
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StoreError::new(
                StoreErrorCode::Configuration,
                format!("s3 uri without bucket: {uri}"),
            ));
        }
        return Ok(StoreLocation::ObjectStore {
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        });
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(StoreError::new(
            StoreErrorCode::Configuration,
            format!("unsupported store uri scheme {scheme}"),
        ));
    }
    Ok(StoreLocation::Local(PathBuf::from(uri)))
}

/// Normalizes `/`-separated segments, resolving `.` and `..`. Returns `None`
/// when a `..` would climb above the start.
fn normalize_segments(path: &str) -> Option<Vec<&str>> {
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop()?;
            }
            s => out.push(s),
        }
    }
    Some(out)
}

/// Joins `rel` under `base`, refusing results that escape `base`.
pub fn uri_join(base: &str, rel: &str) -> Result<String, StoreError> {
    let traversal = || {
        StoreError::new(
            StoreErrorCode::Validation,
            format!("path {rel} escapes its root"),
        )
    };
    let segments = normalize_segments(rel).ok_or_else(traversal)?;
    if rel.starts_with('/') || rel.contains('\\') {
        return Err(traversal());
    }
    let base = base.trim_end_matches('/');
    if segments.is_empty() {
        return Ok(base.to_string());
    }
    Ok(format!("{base}/{}", segments.join("/")))
}
