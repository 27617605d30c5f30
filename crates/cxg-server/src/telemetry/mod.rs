// SPDX-License-Identifier: Apache-2.0

//! Request counters and the Prometheus text endpoint.

use crate::cache::manager::CacheMetrics;
use crate::AppState;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const METRIC_SUBSYSTEM: &str = "cxg";
const METRIC_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Default)]
struct RouteStats {
    count: u64,
    latency_ns: u64,
}

#[derive(Default)]
pub struct ServerMetrics {
    routes: Mutex<BTreeMap<(&'static str, u16), RouteStats>>,
    pub diffex_runs: AtomicU64,
    pub cancelled_requests: AtomicU64,
    pub not_modified: AtomicU64,
    pub tombstone_redirects: AtomicU64,
}

impl ServerMetrics {
    pub fn observe(&self, route: &'static str, status: StatusCode, elapsed: Duration) {
        let Ok(mut routes) = self.routes.lock() else {
            return;
        };
        let stats = routes.entry((route, status.as_u16())).or_default();
        stats.count += 1;
        stats.latency_ns = stats
            .latency_ns
            .saturating_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Requests seen for `route` across all statuses.
    #[must_use]
    pub fn route_count(&self, route: &str) -> u64 {
        self.routes.lock().map_or(0, |routes| {
            routes
                .iter()
                .filter(|((r, _), _)| *r == route)
                .map(|(_, s)| s.count)
                .sum()
        })
    }
}

fn cache_lines(out: &mut String, cache: &str, metrics: &CacheMetrics, entries: usize) {
    let series = [
        ("cache_hits_total", metrics.hits.load(Ordering::Relaxed)),
        ("cache_misses_total", metrics.misses.load(Ordering::Relaxed)),
        ("cache_loads_total", metrics.loads.load(Ordering::Relaxed)),
        ("cache_load_failures_total", metrics.load_failures.load(Ordering::Relaxed)),
        ("cache_evictions_total", metrics.evictions.load(Ordering::Relaxed)),
        ("cache_thrash_total", metrics.thrash.load(Ordering::Relaxed)),
        ("cache_entries", entries as u64),
    ];
    for (name, value) in series {
        out.push_str(
            &"cxg_%NAME%{subsystem=\"%SUB%\",version=\"%VER%\",cache=\"%CACHE%\"} %V%\n"
                .replace("%NAME%", name)
                .replace("%SUB%", METRIC_SUBSYSTEM)
                .replace("%VER%", METRIC_VERSION)
                .replace("%CACHE%", cache)
                .replace("%V%", &value.to_string()),
        );
    }
}

/// Renders every counter in Prometheus text format.
pub async fn render_metrics(state: &AppState) -> String {
    let mut body = String::new();
    cache_lines(
        &mut body,
        "handles",
        &state.handles.metrics,
        state.handles.len().await,
    );
    let resolver = state.locator.cache();
    cache_lines(&mut body, "resolver", &resolver.metrics, resolver.len().await);

    let metrics = &state.metrics;
    if let Ok(routes) = metrics.routes.lock() {
        for ((route, status), stats) in routes.iter() {
            body.push_str(
                &"cxg_http_requests_total{subsystem=\"%SUB%\",version=\"%VER%\",route=\"%R%\",status=\"%S%\"} %C%\n\
cxg_http_request_latency_ns_total{subsystem=\"%SUB%\",version=\"%VER%\",route=\"%R%\",status=\"%S%\"} %L%\n"
                    .replace("%SUB%", METRIC_SUBSYSTEM)
                    .replace("%VER%", METRIC_VERSION)
                    .replace("%R%", route)
                    .replace("%S%", &status.to_string())
                    .replace("%C%", &stats.count.to_string())
                    .replace("%L%", &stats.latency_ns.to_string()),
            );
        }
    }
    for (name, counter) in [
        ("diffexp_runs_total", &metrics.diffex_runs),
        ("http_cancelled_requests_total", &metrics.cancelled_requests),
        ("http_not_modified_total", &metrics.not_modified),
        ("tombstone_redirects_total", &metrics.tombstone_redirects),
    ] {
        body.push_str(
            &"cxg_%NAME%{subsystem=\"%SUB%\",version=\"%VER%\"} %V%\n"
                .replace("%NAME%", name)
                .replace("%SUB%", METRIC_SUBSYSTEM)
                .replace("%VER%", METRIC_VERSION)
                .replace("%V%", &counter.load(Ordering::Relaxed).to_string()),
        );
    }
    body
}

pub(crate) async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = render_metrics(&state).await;
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_counts_sum_over_statuses() {
        let metrics = ServerMetrics::default();
        metrics.observe("schema", StatusCode::OK, Duration::from_millis(2));
        metrics.observe("schema", StatusCode::NOT_MODIFIED, Duration::from_millis(1));
        metrics.observe("config", StatusCode::OK, Duration::from_millis(1));
        assert_eq!(metrics.route_count("schema"), 2);
        assert_eq!(metrics.route_count("config"), 1);
        assert_eq!(metrics.route_count("layout/obs"), 0);
    }
}
