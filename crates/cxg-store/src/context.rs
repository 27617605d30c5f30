// SPDX-License-Identifier: Apache-2.0

use crate::backend::{LocalFsBackend, StorageBackend};
use crate::backend_http::HttpBackend;
use crate::error::{StoreError, StoreErrorCode};
use crate::retry::RetryPolicy;
use crate::uri::{parse_store_uri, StoreLocation};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL that `s3://bucket/key` URIs are served from.
    pub http_endpoint: Option<String>,
    pub bearer_token: Option<String>,
    pub retry: RetryPolicy,
}

/// Process-scoped store configuration, threaded into every handle at open
/// time. Once the first handle has opened the configuration is frozen.
#[derive(Clone, Default)]
pub struct StoreContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    config: Mutex<StoreConfig>,
    opened: AtomicBool,
}

impl StoreContext {
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config: Mutex::new(config),
                opened: AtomicBool::new(false),
            }),
        }
    }

    pub fn reconfigure(&self, config: StoreConfig) -> Result<(), StoreError> {
        let mut guard = self.inner.config.lock().map_err(|_| poisoned())?;
        if self.inner.opened.load(Ordering::Acquire) {
            return Err(StoreError::new(
                StoreErrorCode::Configuration,
                "store context cannot be reconfigured after a handle was opened",
            ));
        }
        *guard = config;
        Ok(())
    }

    #[must_use]
    pub fn has_opened(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    /// Builds the backend for `uri` and freezes the configuration.
    pub fn backend_for(&self, uri: &str) -> Result<Arc<dyn StorageBackend>, StoreError> {
        let config = self.inner.config.lock().map_err(|_| poisoned())?;
        let backend: Arc<dyn StorageBackend> = match parse_store_uri(uri)? {
            StoreLocation::Local(path) => Arc::new(LocalFsBackend::new(path)),
            StoreLocation::Http(base) => Arc::new(
                HttpBackend::new(base)?
                    .with_bearer_token(config.bearer_token.clone())
                    .with_retry(config.retry.clone()),
            ),
            StoreLocation::ObjectStore { bucket, key } => {
                let endpoint = config.http_endpoint.as_deref().ok_or_else(|| {
                    StoreError::new(
                        StoreErrorCode::Configuration,
                        format!("no object-store endpoint configured for {uri}"),
                    )
                })?;
                let base = format!("{}/{bucket}/{key}", endpoint.trim_end_matches('/'));
                Arc::new(
                    HttpBackend::new(base)?
                        .with_bearer_token(config.bearer_token.clone())
                        .with_retry(config.retry.clone()),
                )
            }
        };
        self.inner.opened.store(true, Ordering::Release);
        Ok(backend)
    }
}

fn poisoned() -> StoreError {
    StoreError::new(StoreErrorCode::Configuration, "store context lock poisoned")
}
