// SPDX-License-Identifier: Apache-2.0

use crate::config::HttpConfig;
use crate::ops::{CachePolicy, Media, OpOutput};
use crate::AppState;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use brotli::CompressorWriter;
use cxg_core::{sha256_hex, AccessReason, CxgError, Tombstone};
use flate2::{write::GzEncoder, Compression};
use serde_json::json;
use std::io::Write;
use std::sync::atomic::Ordering;

#[must_use]
pub fn status_for(err: &CxgError) -> StatusCode {
    match err {
        CxgError::Filter(_) | CxgError::ExceedsLimit(_) | CxgError::UnsupportedSummaryMethod(_) => {
            StatusCode::BAD_REQUEST
        }
        CxgError::DatasetNotFound(_) => StatusCode::NOT_FOUND,
        CxgError::DatasetAccess {
            reason: AccessReason::Unauthenticated,
            ..
        } => StatusCode::UNAUTHORIZED,
        CxgError::DatasetAccess { .. } => StatusCode::FORBIDDEN,
        CxgError::Tombstone(_) => StatusCode::FOUND,
        CxgError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
        CxgError::CacheExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn api_error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = Json(json!({"error": {"code": code, "message": message}}));
    (status, body).into_response()
}

pub(crate) fn error_response(err: &CxgError) -> Response {
    api_error_response(status_for(err), err.code(), &err.to_string())
}

/// 302 to the owning collection page of a withdrawn dataset.
pub(crate) fn tombstone_redirect(web_base: Option<&str>, tombstone: &Tombstone) -> Response {
    let base = web_base.unwrap_or("");
    let mut location = match &tombstone.collection_id {
        Some(collection) => format!("{base}/collections/{collection}"),
        None => format!("{base}/"),
    };
    if let Some(dataset) = &tombstone.dataset_id {
        location.push_str("?tombstoned_dataset_id=");
        location.push_str(dataset);
    }
    let mut response = StatusCode::FOUND.into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

/// True when the `Accept` header admits `media`. A missing header admits
/// everything.
#[must_use]
pub fn accepts(headers: &HeaderMap, media: Media) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    if accept.trim().is_empty() {
        return true;
    }
    accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .map(str::trim)
        .any(|m| m == "*/*" || m == "application/*" || m.eq_ignore_ascii_case(media.content_type()))
}

#[must_use]
pub fn content_type_is(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
}

pub(crate) fn accepted_encoding(headers: &HeaderMap) -> Option<&'static str> {
    let accept = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())?;
    if accept.contains("br") {
        Some("br")
    } else if accept.contains("gzip") {
        Some("gzip")
    } else {
        None
    }
}

pub(crate) fn maybe_compress_response(
    headers: &HeaderMap,
    http: &HttpConfig,
    bytes: Vec<u8>,
) -> Result<(Vec<u8>, Option<&'static str>), CxgError> {
    if !http.enable_response_compression || bytes.len() < http.compression_min_bytes {
        return Ok((bytes, None));
    }
    match accepted_encoding(headers) {
        Some("gzip") => {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity((bytes.len() / 2).max(256)),
                Compression::fast(),
            );
            encoder
                .write_all(&bytes)
                .map_err(|e| CxgError::compute(format!("gzip encoding failed: {e}")))?;
            let compressed = encoder
                .finish()
                .map_err(|e| CxgError::compute(format!("gzip finalize failed: {e}")))?;
            Ok((compressed, Some("gzip")))
        }
        Some("br") => {
            let mut compressed = Vec::with_capacity((bytes.len() / 2).max(256));
            {
                let mut writer = CompressorWriter::new(&mut compressed, 4096, 4, 22);
                writer
                    .write_all(&bytes)
                    .map_err(|e| CxgError::compute(format!("brotli encoding failed: {e}")))?;
            }
            Ok((compressed, Some("br")))
        }
        _ => Ok((bytes, None)),
    }
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .map(|t| t.trim().trim_start_matches("W/"))
                .any(|t| t == "*" || t == etag)
        })
}

/// Turns an operation result into the HTTP response: cache headers, a
/// strong ETag on immutable bodies (304 on a match), and compression.
pub(crate) fn op_response(
    state: &AppState,
    headers: &HeaderMap,
    out: OpOutput,
) -> Result<Response, CxgError> {
    let http = &state.config.http;
    let cache_control = match out.cache {
        CachePolicy::Immutable => format!("immutable, max-age={}", http.immutable_max_age_secs),
        CachePolicy::NoStore => "no-store, max-age=0".to_string(),
    };
    let etag = (out.cache == CachePolicy::Immutable).then(|| format!("\"{}\"", sha256_hex(&out.body)));

    let mut response = match &etag {
        Some(tag) if etag_matches(headers, tag) => {
            state.metrics.not_modified.fetch_add(1, Ordering::Relaxed);
            StatusCode::NOT_MODIFIED.into_response()
        }
        _ => {
            let (body, encoding) = maybe_compress_response(headers, http, out.body)?;
            let mut response = (StatusCode::OK, body).into_response();
            let h = response.headers_mut();
            h.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(out.media.content_type()),
            );
            if let Some(encoding) = encoding {
                h.insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
            }
            response
        }
    };
    let h = response.headers_mut();
    h.insert(header::VARY, HeaderValue::from_static("accept-encoding"));
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        h.insert(header::CACHE_CONTROL, value);
    }
    if let Some(value) = etag.and_then(|t| HeaderValue::from_str(&t).ok()) {
        h.insert(header::ETAG, value);
    }
    Ok(response)
}

pub(crate) fn make_request_id(state: &AppState) -> String {
    let id = state.request_id_seed.fetch_add(1, Ordering::Relaxed);
    format!("req-{id:016x}")
}

pub(crate) fn propagated_request_id(headers: &HeaderMap, state: &AppState) -> String {
    if let Some(raw) = headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    make_request_id(state)
}

pub(crate) fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(v) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert("x-request-id", v);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_for(&CxgError::filter("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CxgError::exceeds_limit("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CxgError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CxgError::forbidden("x")), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&CxgError::storage("x")), StatusCode::FORBIDDEN);
        assert_eq!(
            status_for(&CxgError::DatasetAccess {
                reason: AccessReason::Unauthenticated,
                message: "x".to_string()
            }),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(status_for(&CxgError::unsupported("x")), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(
            status_for(&CxgError::CacheExhausted("x".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CxgError::compute("x")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn accept_header_is_matched_by_media_range() {
        assert!(accepts(&HeaderMap::new(), Media::Matrix));
        assert!(accepts(&headers(&[("accept", "*/*")]), Media::Json));
        assert!(accepts(
            &headers(&[("accept", "text/html, application/json;q=0.9")]),
            Media::Json
        ));
        assert!(accepts(
            &headers(&[("accept", "application/octet-stream")]),
            Media::Matrix
        ));
        assert!(!accepts(&headers(&[("accept", "application/json")]), Media::Matrix));
        assert!(!accepts(&headers(&[("accept", "text/csv")]), Media::Json));
    }

    #[test]
    fn content_type_ignores_parameters() {
        let h = headers(&[("content-type", "application/json; charset=utf-8")]);
        assert!(content_type_is(&h, "application/json"));
        assert!(!content_type_is(&h, "application/x-www-form-urlencoded"));
        assert!(!content_type_is(&HeaderMap::new(), "application/json"));
    }

    #[test]
    fn tombstone_redirect_points_at_the_collection() {
        let response = tombstone_redirect(
            Some("https://cells.example"),
            &Tombstone {
                collection_id: Some("X".to_string()),
                dataset_id: Some("Y".to_string()),
            },
        );
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get("location").and_then(|v| v.to_str().ok()),
            Some("https://cells.example/collections/X?tombstoned_dataset_id=Y")
        );
    }

    #[test]
    fn weak_and_list_etags_match() {
        let h = headers(&[("if-none-match", "\"a\", W/\"b\"")]);
        assert!(etag_matches(&h, "\"b\""));
        assert!(!etag_matches(&h, "\"c\""));
        assert!(etag_matches(&headers(&[("if-none-match", "*")]), "\"c\""));
    }
}
