// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use cxg_core::CxgError;
use cxg_query::DiffexEngine;
use cxg_store::{CxgAdaptor, StoreContext};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

mod cache;
mod config;
mod http;
mod locator;
mod ops;
mod sync;
mod telemetry;

#[cfg(test)]
mod cache_manager_tests;

pub use cache::entry::{CacheLease, CacheValue};
pub use cache::manager::{CacheConfig, CacheManager, CacheMetrics};
pub use config::{
    validate_startup_config, AuthConfig, CacheSection, CachesConfig, DatarootConfig,
    FeaturesConfig, HttpConfig, LimitsConfig, MetadataServiceConfig, PresentationConfig,
    ServerConfig, CONFIG_FILE_ENV,
};
pub use http::response::status_for;
pub use locator::{
    scoped_path, DatasetMeta, HttpMetadataClient, Locator, MetadataClient, ResolvedLocation,
};
pub use ops::{CachePolicy, Media};
pub use sync::rwlock::{DemotingRwLock, ReadGuard, WriteGuard};
pub use telemetry::{render_metrics, ServerMetrics};

pub const CRATE_NAME: &str = "cxg-server";

impl CacheValue for CxgAdaptor {
    fn cleanup(&self) -> Result<(), CxgError> {
        self.close();
        Ok(())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub locator: Arc<Locator>,
    pub handles: Arc<CacheManager<CxgAdaptor>>,
    pub engine: Arc<DiffexEngine>,
    pub store: StoreContext,
    pub metrics: Arc<ServerMetrics>,
    pub request_id_seed: Arc<AtomicU64>,
}

impl AppState {
    /// Builds the shared state. The config is not validated here; callers
    /// run [`validate_startup_config`] first.
    pub fn new(config: ServerConfig) -> Result<Self, CxgError> {
        let store = StoreContext::new(config.store.clone());
        let locator = Locator::from_config(&config, store.clone())?;
        Ok(Self::with_locator(config, locator, store))
    }

    #[must_use]
    pub fn with_locator(config: ServerConfig, locator: Locator, store: StoreContext) -> Self {
        Self {
            handles: Arc::new(CacheManager::new(
                "handles",
                config.cache.handles.cache_config(),
            )),
            engine: Arc::new(DiffexEngine::new(config.diffexp.clone())),
            locator: Arc::new(locator),
            store,
            metrics: Arc::new(ServerMetrics::default()),
            request_id_seed: Arc::new(AtomicU64::new(1)),
            config: Arc::new(config),
        }
    }

    /// Closes every cached dataset handle.
    pub async fn shutdown(&self) {
        self.handles.evict_all().await;
        self.locator.cache().evict_all().await;
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health_handler))
        .route("/metrics", get(telemetry::metrics_handler))
        .fallback(http::api_handler)
        .layer(from_fn_with_state(
            state.clone(),
            http::request_tracing_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.config.http.max_body_bytes))
        .with_state(state)
}
