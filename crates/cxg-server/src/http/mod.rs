// SPDX-License-Identifier: Apache-2.0

//! HTTP transport. Every dataset URL lands in [`api_handler`], which
//! resolves the dataset, leases its handle, and runs the operation on a
//! blocking thread.

pub mod response;
pub mod route;

use crate::locator::ResolvedLocation;
use crate::ops::{self, CachePolicy, OpContext, OpOutput};
use crate::AppState;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, Request, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cxg_core::{AccessReason, CxgError};
use cxg_query::{filter_from_query, Filter};
use cxg_store::{AdaptorOptions, Axis, CxgAdaptor};
use response::{
    accepts, api_error_response, content_type_is, error_response, op_response,
    propagated_request_id, tombstone_redirect, with_request_id,
};
use route::{parse_pairs, split_api_path, MethodSupport, Op, Target};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn, Instrument};

pub(crate) async fn health_handler() -> Response {
    Json(json!({"status": "pass"})).into_response()
}

pub(crate) async fn request_tracing_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = propagated_request_id(request.headers(), &state);
    let method = request.method().to_string();
    let route = request.uri().path().to_string();
    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %method,
        route = %route,
    );
    let started = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    span.in_scope(|| {
        info!(
            request_id = %request_id,
            status = response.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request complete"
        );
    });
    with_request_id(response, &request_id)
}

/// Sets the cancellation flag when the request future is dropped before
/// the operation finished.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    state: AppState,
    finished: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.finished {
            self.flag.store(true, Ordering::Relaxed);
            self.state
                .metrics
                .cancelled_requests
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Decoded request parameters, parsed before the dataset is opened.
struct OpInput {
    pairs: Vec<(String, String)>,
    body: Option<Value>,
    summary_cache: CachePolicy,
}

impl OpInput {
    fn parse(op: Op, method: &Method, uri: &Uri, body: &Bytes) -> Result<Self, CxgError> {
        let mut input = Self {
            pairs: parse_pairs(uri.query())?,
            body: None,
            summary_cache: CachePolicy::Immutable,
        };
        match op.body_media(method) {
            Some("application/json") => {
                let value = serde_json::from_slice(body)
                    .map_err(|e| CxgError::filter(format!("malformed JSON body: {e}")))?;
                input.body = Some(value);
            }
            Some(_) => {
                let raw = std::str::from_utf8(body)
                    .map_err(|_| CxgError::filter("form body is not UTF-8"))?;
                input.pairs = parse_pairs(Some(raw.trim()))?;
                input.summary_cache = CachePolicy::NoStore;
            }
            None => {}
        }
        Ok(input)
    }

    fn values(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn nbins(&self) -> Result<Option<u32>, CxgError> {
        self.pairs
            .iter()
            .find(|(k, _)| k == "nbins")
            .map(|(_, v)| {
                v.parse::<u32>()
                    .map_err(|_| CxgError::filter(format!("nbins must be a positive integer, got {v}")))
            })
            .transpose()
    }

    fn filter(&self) -> Result<Filter, CxgError> {
        match &self.body {
            Some(body) => Filter::from_json(
                body.get("filter")
                    .cloned()
                    .ok_or_else(|| CxgError::filter("body requires a filter"))?,
            ),
            None => filter_from_query(&self.pairs),
        }
    }

    fn json(&self) -> Result<&Value, CxgError> {
        self.body
            .as_ref()
            .ok_or_else(|| CxgError::filter("request requires a JSON body"))
    }
}

fn run_op(
    state: &AppState,
    ctx: OpContext<'_>,
    op: Op,
    input: &OpInput,
    cancel: &AtomicBool,
) -> Result<OpOutput, CxgError> {
    match op {
        Op::S3Uri => ops::s3_uri(ctx),
        Op::Schema => ops::schema(ctx),
        Op::Config => ops::config(ctx),
        Op::AnnotationsObs => ops::annotations(ctx, Axis::Obs, &input.values("annotation-name")),
        Op::AnnotationsVar => ops::annotations(ctx, Axis::Var, &input.values("annotation-name")),
        Op::DataVar => ops::data_var(ctx, &input.filter()?, input.nbins()?),
        Op::Colors => ops::colors(ctx),
        Op::DiffexpObs | Op::DiffexpObs2 => {
            let body = input.json()?;
            let out = if op == Op::DiffexpObs {
                ops::diffexp_obs(ctx, &state.engine, body, cancel)?
            } else {
                ops::diffexp_obs2(ctx, &state.engine, body, cancel)?
            };
            state.metrics.diffex_runs.fetch_add(1, Ordering::Relaxed);
            Ok(out)
        }
        Op::LayoutObs => ops::layout_obs(ctx, &input.values("layout-name")),
        Op::Genesets => ops::genesets(ctx),
        Op::SummarizeVar => ops::summarize_var(ctx, &input.pairs, input.summary_cache),
        Op::DatasetMetadata => ops::dataset_metadata(ctx),
    }
}

fn request_user(state: &AppState, headers: &HeaderMap) -> Result<String, CxgError> {
    headers
        .get(state.config.auth.user_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| CxgError::DatasetAccess {
            reason: AccessReason::Unauthenticated,
            message: "user-scoped datasets require an authenticated user".to_string(),
        })
}

async fn resolve(
    state: &AppState,
    tag: &str,
    dataset: &str,
    user: Option<&str>,
) -> Result<ResolvedLocation, CxgError> {
    let lease = state.locator.resolve(tag, dataset, user).await?;
    Ok((*lease).clone())
}

async fn locate(
    state: &AppState,
    target: Target,
    headers: &HeaderMap,
) -> Result<ResolvedLocation, CxgError> {
    match target {
        Target::StoreUri(uri) => state.locator.check_store_uri(&uri),
        Target::Custom { tag, dataset } => {
            if !state.locator.dataroot(&tag).is_some_and(|d| d.user_scoped) {
                return Err(CxgError::not_found(format!(
                    "dataroot {tag} holds no custom datasets"
                )));
            }
            let user = request_user(state, headers)?;
            resolve(state, &tag, &dataset, Some(&user)).await
        }
        Target::Dataroot { tag, dataset } => {
            let user = match state.locator.dataroot(&tag) {
                Some(d) if d.user_scoped => Some(request_user(state, headers)?),
                _ => None,
            };
            resolve(state, &tag, &dataset, user.as_deref()).await
        }
    }
}

async fn open_dataset(state: &AppState, uri: String) -> Result<CxgAdaptor, CxgError> {
    let store = state.store.clone();
    let options = AdaptorOptions {
        max_categories: state.config.presentation.max_categories,
    };
    tokio::task::spawn_blocking(move || CxgAdaptor::open(&store, &uri, options))
        .await
        .map_err(|e| CxgError::compute(format!("dataset open task failed: {e}")))?
        .map_err(CxgError::from)
}

async fn serve(
    state: &AppState,
    op: Op,
    target: Target,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, CxgError> {
    let location = locate(state, target, headers).await?;
    let input = OpInput::parse(op, method, uri, body)?;
    let lease = state
        .handles
        .get(&location.store_uri, || {
            open_dataset(state, location.store_uri.clone())
        })
        .await?;

    let flag = Arc::new(AtomicBool::new(false));
    let mut guard = CancelOnDrop {
        flag: Arc::clone(&flag),
        state: state.clone(),
        finished: false,
    };
    let store_uri = location.store_uri.clone();
    let worker = state.clone();
    let out = tokio::task::spawn_blocking(move || {
        let adaptor: &CxgAdaptor = &lease;
        let ctx = OpContext {
            adaptor,
            config: &worker.config,
            location: &location,
        };
        run_op(&worker, ctx, op, &input, &flag)
    })
    .await
    .map_err(|e| CxgError::compute(format!("operation task failed: {e}")))?;
    guard.finished = true;
    match out {
        Ok(output) => op_response(state, headers, output),
        Err(err) => {
            // the worker closure owned the lease, so no reader is left here
            if err.is_access_error() && state.handles.evict(&store_uri).await {
                warn!(store_uri = %store_uri, error = %err, "evicted dataset handle after access error");
            }
            Err(err)
        }
    }
}

async fn dispatch(
    state: &AppState,
    op: Op,
    target: Target,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    match op.method_support(method) {
        MethodSupport::Allowed => {}
        MethodSupport::NotImplemented => {
            return error_response(&CxgError::unsupported(format!(
                "{method} {} is not supported",
                op.route()
            )));
        }
        MethodSupport::NotAllowed => {
            return api_error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                &format!("{method} is not allowed on {}", op.route()),
            );
        }
    }
    if !accepts(headers, op.media()) {
        return api_error_response(
            StatusCode::NOT_ACCEPTABLE,
            "NotAcceptable",
            &format!("{} responds with {}", op.route(), op.media().content_type()),
        );
    }
    if let Some(expected) = op.body_media(method) {
        if !content_type_is(headers, expected) {
            return api_error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "UnsupportedMediaType",
                &format!("{} expects {expected}", op.route()),
            );
        }
    }
    match serve(state, op, target, method, uri, headers, body).await {
        Ok(response) => response,
        Err(CxgError::Tombstone(tombstone)) => {
            state
                .metrics
                .tombstone_redirects
                .fetch_add(1, Ordering::Relaxed);
            tombstone_redirect(state.locator.web_base(), &tombstone)
        }
        Err(err) => {
            let response = error_response(&err);
            if response.status().is_server_error() {
                warn!(op = op.route(), error = %err, "operation failed");
            } else {
                info!(op = op.route(), error = %err, "request rejected");
            }
            response
        }
    }
}

/// Fallback handler for every dataset URL shape under `api/v0.2` or
/// `api/v0.3`.
pub(crate) async fn api_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let Some((target, op_path)) = split_api_path(uri.path()) else {
        return api_error_response(StatusCode::NOT_FOUND, "NotFound", "no such route");
    };
    let Some(op) = Op::from_path(&op_path) else {
        return api_error_response(
            StatusCode::NOT_FOUND,
            "NotFound",
            &format!("unknown operation {op_path}"),
        );
    };
    let response = dispatch(&state, op, target, &method, &uri, &headers, &body).await;
    state
        .metrics
        .observe(op.route(), response.status(), started.elapsed());
    response
}
