// SPDX-License-Identifier: Apache-2.0

//! Maps `(dataroot tag, dataset id)` to a physical store URI.

mod metadata;

pub use metadata::{DatasetMeta, HttpMetadataClient, MetadataClient};

use crate::cache::entry::{CacheLease, CacheValue};
use crate::cache::manager::{CacheConfig, CacheManager};
use crate::config::{DatarootConfig, ServerConfig};
use cxg_core::{CxgError, Tombstone};
use cxg_store::meta::GROUP_METADATA;
use cxg_store::{uri_join, StoreContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

const USER_MARKER: &str = "userID-";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolvedLocation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    pub store_uri: String,
    pub tombstoned: bool,
}

impl ResolvedLocation {
    #[must_use]
    pub fn from_store_uri(store_uri: impl Into<String>) -> Self {
        Self {
            store_uri: store_uri.into(),
            ..Self::default()
        }
    }
}

impl CacheValue for ResolvedLocation {}

pub struct Locator {
    dataroots: BTreeMap<String, DatarootConfig>,
    web_base: Option<String>,
    client: Option<Arc<dyn MetadataClient>>,
    store: StoreContext,
    cache: CacheManager<ResolvedLocation>,
}

impl Locator {
    #[must_use]
    pub fn new(
        dataroots: BTreeMap<String, DatarootConfig>,
        web_base: Option<String>,
        client: Option<Arc<dyn MetadataClient>>,
        store: StoreContext,
        cache: CacheConfig,
    ) -> Self {
        Self {
            dataroots,
            web_base: web_base.map(|w| w.trim_end_matches('/').to_string()),
            client,
            store,
            cache: CacheManager::new("resolver", cache),
        }
    }

    /// Builds the resolver from server config, with the HTTP metadata client
    /// when a metadata service is configured.
    pub fn from_config(config: &ServerConfig, store: StoreContext) -> Result<Self, CxgError> {
        let client: Option<Arc<dyn MetadataClient>> = match &config.metadata_service.api_base {
            Some(base) => Some(Arc::new(HttpMetadataClient::new(
                base,
                std::time::Duration::from_millis(config.metadata_service.timeout_ms),
            )?)),
            None => None,
        };
        Ok(Self::new(
            config.dataroots.clone(),
            config.metadata_service.web_base.clone(),
            client,
            store,
            config.cache.resolver.cache_config(),
        ))
    }

    #[must_use]
    pub fn cache(&self) -> &CacheManager<ResolvedLocation> {
        &self.cache
    }

    #[must_use]
    pub fn dataroot(&self, tag: &str) -> Option<&DatarootConfig> {
        self.dataroots.get(tag)
    }

    #[must_use]
    pub fn web_base(&self) -> Option<&str> {
        self.web_base.as_deref()
    }

    /// Resolves a dataset, consulting the metadata service first.
    ///
    /// `user` is the authenticated user id for user-scoped dataroots; `None`
    /// skips the ownership check.
    pub async fn resolve(
        &self,
        tag: &str,
        dataset: &str,
        user: Option<&str>,
    ) -> Result<CacheLease<ResolvedLocation>, CxgError> {
        let dataroot = self
            .dataroots
            .get(tag)
            .ok_or_else(|| CxgError::forbidden(format!("unknown dataroot {tag}")))?;
        let stored = if dataroot.user_scoped {
            scoped_path(dataset, user)?
        } else {
            dataset.to_string()
        };
        let key = format!("{tag}/{dataset}");
        let root = dataroot.root.clone();
        self.cache
            .get(&key, || self.load(tag, dataset, root, stored))
            .await
    }

    async fn load(
        &self,
        tag: &str,
        dataset: &str,
        root: String,
        stored: String,
    ) -> Result<ResolvedLocation, CxgError> {
        let mut lookup_failure = None;
        if let (Some(client), Some(web_base)) = (&self.client, &self.web_base) {
            let url = format!("{web_base}/{tag}/{dataset}/");
            match client.dataset_meta(&url).await {
                Ok(Some(meta)) if meta.tombstoned => {
                    info!(tag, dataset, collection_id = ?meta.collection_id, "dataset tombstoned");
                    return Err(CxgError::Tombstone(Tombstone {
                        collection_id: meta.collection_id,
                        dataset_id: meta.dataset_id,
                    }));
                }
                Ok(Some(meta)) => match meta.s3_uri {
                    Some(store_uri) if !store_uri.is_empty() => {
                        return Ok(ResolvedLocation {
                            collection_id: meta.collection_id,
                            collection_visibility: meta.collection_visibility,
                            dataset_id: meta.dataset_id,
                            store_uri,
                            tombstoned: false,
                        });
                    }
                    _ => warn!(tag, dataset, "metadata without store uri, using dataroot"),
                },
                Ok(None) => info!(tag, dataset, "metadata service has no record, using dataroot"),
                Err(e) => {
                    warn!(tag, dataset, error = %e, "metadata lookup failed, using dataroot");
                    lookup_failure = Some(e);
                }
            }
        }
        match (self.fallback(&root, &stored).await, lookup_failure) {
            // the record may exist elsewhere, so the miss must not be cached
            (Err(CxgError::DatasetNotFound(miss)), Some(failure)) => Err(CxgError::DatasetMetadata(
                format!("{failure}; dataroot fallback: {miss}"),
            )),
            (outcome, _) => outcome,
        }
    }

    async fn fallback(&self, root: &str, stored: &str) -> Result<ResolvedLocation, CxgError> {
        let store_uri = uri_join(root, stored)
            .map_err(|e| CxgError::forbidden(format!("invalid dataset path: {}", e.message)))?;
        if store_uri.trim_end_matches('/') == root.trim_end_matches('/') {
            return Err(CxgError::forbidden("dataset path names the dataroot itself"));
        }
        let context = self.store.clone();
        let target = store_uri.clone();
        let exists = tokio::task::spawn_blocking(move || {
            context.backend_for(&target)?.exists(GROUP_METADATA)
        })
        .await
        .map_err(|e| CxgError::compute(format!("existence check task failed: {e}")))?
        .map_err(CxgError::from)?;
        if !exists {
            return Err(CxgError::not_found(format!("no dataset at {store_uri}")));
        }
        Ok(ResolvedLocation::from_store_uri(store_uri))
    }

    /// Accepts a direct store URI only when it lies under a configured
    /// dataroot.
    pub fn check_store_uri(&self, uri: &str) -> Result<ResolvedLocation, CxgError> {
        let under_root = self.dataroots.values().any(|d| {
            let root = d.root.trim_end_matches('/');
            uri.strip_prefix(root)
                .is_some_and(|rest| rest.starts_with('/') && !rest.split('/').any(|s| s == ".."))
        });
        if !under_root {
            return Err(CxgError::forbidden(format!(
                "{uri} is not under a configured dataroot"
            )));
        }
        Ok(ResolvedLocation::from_store_uri(uri))
    }
}

/// Validates a user-scoped dataset id and returns its stored path.
///
/// The first segment must be `userID-<id>` with `<id>` equal to `user` when a
/// user is known. The stored path replaces the marker with the bare id.
pub fn scoped_path(dataset: &str, user: Option<&str>) -> Result<String, CxgError> {
    let mut segments = dataset.split('/');
    let owner = segments
        .next()
        .and_then(|s| s.strip_prefix(USER_MARKER))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| CxgError::forbidden(format!("{dataset} is not in a user folder")))?;
    if let Some(user) = user {
        if user != owner {
            return Err(CxgError::forbidden(format!(
                "user {user} may not access datasets of {owner}"
            )));
        }
    }
    let rest: Vec<&str> = segments.collect();
    if rest.iter().any(|s| *s == "..") {
        return Err(CxgError::forbidden(format!("{dataset} contains '..'")));
    }
    if rest.iter().all(|s| s.is_empty()) {
        return Err(CxgError::forbidden(format!("{dataset} names no dataset")));
    }
    Ok(std::iter::once(owner)
        .chain(rest)
        .collect::<Vec<_>>()
        .join("/"))
}
