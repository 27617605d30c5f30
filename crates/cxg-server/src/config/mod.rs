// SPDX-License-Identifier: Apache-2.0

//! Server configuration: YAML file (`CXG_CONFIG_FILE`) overlaid by `CXG_*`
//! environment variables.

use crate::cache::manager::CacheConfig;
use cxg_core::CxgError;
use cxg_query::{DiffexConfig, QueryLimits};
use cxg_store::{parse_store_uri, StoreConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_ENV: &str = "CXG_CONFIG_FILE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatarootConfig {
    /// Physical root URI that dataset ids are joined under.
    pub root: String,
    /// Datasets live in per-user `userID-<id>` folders.
    #[serde(default)]
    pub user_scoped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MetadataServiceConfig {
    pub api_base: Option<String>,
    pub web_base: Option<String>,
    pub timeout_ms: u64,
}

impl Default for MetadataServiceConfig {
    fn default() -> Self {
        Self {
            api_base: None,
            web_base: None,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_entries: usize,
    pub ttl_secs: Option<u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_entries: 8,
            ttl_secs: Some(300),
        }
    }
}

impl CacheSection {
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.max_entries,
            ttl: self.ttl_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
    pub resolver: CacheSection,
    pub handles: CacheSection,
}

impl Default for CachesConfig {
    fn default() -> Self {
        Self {
            resolver: CacheSection {
                max_entries: 1_000,
                ttl_secs: Some(60),
            },
            handles: CacheSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(flatten)]
    pub query: QueryLimits,
    /// Encoded bodies above this size fail with `ExceedsLimitError`.
    pub response_max_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    pub custom_colors: bool,
    pub diffexp: bool,
    /// Turn diffex off for datasets with more cells than
    /// `limits.diffexp_cellcount_max`.
    pub disable_diffexp_for_large: bool,
    pub user_annotations: bool,
    pub genesets_readonly: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            custom_colors: true,
            diffexp: true,
            disable_diffexp_for_large: false,
            user_annotations: false,
            genesets_readonly: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    pub max_categories: usize,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            max_categories: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Trusted header carrying the authenticated user id.
    pub user_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_header: "x-user-id".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub max_body_bytes: usize,
    pub enable_response_compression: bool,
    pub compression_min_bytes: usize,
    /// `max-age` for immutable responses.
    pub immutable_max_age_secs: u64,
    pub shutdown_drain_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5005".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            enable_response_compression: true,
            compression_min_bytes: 4096,
            immutable_max_age_secs: 31_536_000,
            shutdown_drain_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub dataroots: BTreeMap<String, DatarootConfig>,
    pub metadata_service: MetadataServiceConfig,
    pub cache: CachesConfig,
    pub limits: LimitsConfig,
    pub diffexp: DiffexConfig,
    pub features: FeaturesConfig,
    pub presentation: PresentationConfig,
    pub store: StoreConfig,
    pub auth: AuthConfig,
    pub http: HttpConfig,
}

fn env_bool(get: &dyn Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    get(name)
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(get: &dyn Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    get(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(get: &dyn Fn(&str) -> Option<String>, name: &str, default: usize) -> usize {
    get(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_string(get: &dyn Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_map(get: &dyn Fn(&str) -> Option<String>, name: &str) -> Vec<(String, String)> {
    get(name)
        .unwrap_or_default()
        .split(',')
        .filter_map(|item| {
            let (k, v) = item.split_once('=')?;
            let key = k.trim();
            let value = v.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

impl ServerConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, CxgError> {
        serde_yaml::from_str(raw)
            .map_err(|e| CxgError::configuration(format!("invalid config yaml: {e}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, CxgError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CxgError::configuration(format!("read config {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// File named by `CXG_CONFIG_FILE` (if any) with the process environment
    /// applied on top.
    pub fn from_env() -> Result<Self, CxgError> {
        let mut config = match env::var(CONFIG_FILE_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env(&|name| env::var(name).ok());
        Ok(config)
    }

    /// Overlays `CXG_*` variables read through `get`. Unset or unparsable
    /// values keep the current setting.
    pub fn apply_env(&mut self, get: &dyn Fn(&str) -> Option<String>) {
        for (tag, root) in env_map(get, "CXG_DATAROOTS") {
            self.dataroots.insert(
                tag,
                DatarootConfig {
                    root,
                    user_scoped: false,
                },
            );
        }
        for tag in get("CXG_USER_SCOPED_DATAROOTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
        {
            if let Some(root) = self.dataroots.get_mut(tag) {
                root.user_scoped = true;
            }
        }

        let meta = &mut self.metadata_service;
        if let Some(v) = env_string(get, "CXG_METADATA_API_BASE") {
            meta.api_base = Some(v);
        }
        if let Some(v) = env_string(get, "CXG_WEB_BASE") {
            meta.web_base = Some(v);
        }
        meta.timeout_ms = env_u64(get, "CXG_METADATA_TIMEOUT_MS", meta.timeout_ms);

        let handles = &mut self.cache.handles;
        handles.max_entries = env_usize(get, "CXG_HANDLE_CACHE_MAX_ENTRIES", handles.max_entries);
        if let Some(ttl) = get("CXG_HANDLE_CACHE_TTL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            handles.ttl_secs = (ttl > 0).then_some(ttl);
        }
        let resolver = &mut self.cache.resolver;
        resolver.max_entries =
            env_usize(get, "CXG_RESOLVER_CACHE_MAX_ENTRIES", resolver.max_entries);
        if let Some(ttl) = get("CXG_RESOLVER_CACHE_TTL_SECS").and_then(|v| v.parse::<u64>().ok()) {
            resolver.ttl_secs = (ttl > 0).then_some(ttl);
        }

        let limits = &mut self.limits;
        limits.query.column_request_max =
            env_usize(get, "CXG_COLUMN_REQUEST_MAX", limits.query.column_request_max);
        if let Some(max) = get("CXG_DIFFEXP_CELLCOUNT_MAX").and_then(|v| v.parse::<usize>().ok()) {
            limits.query.diffexp_cellcount_max = Some(max);
        }
        if let Some(cutoff) = get("CXG_DIFFEXP_LFC_CUTOFF").and_then(|v| v.parse::<f64>().ok()) {
            limits.query.diffexp_lfc_cutoff = cutoff;
        }
        limits.query.diffexp_top_n = env_usize(get, "CXG_DIFFEXP_TOP_N", limits.query.diffexp_top_n);
        if let Some(max) = get("CXG_RESPONSE_MAX_BYTES").and_then(|v| v.parse::<usize>().ok()) {
            limits.response_max_bytes = Some(max);
        }

        let dx = &mut self.diffexp;
        dx.max_workers = env_usize(get, "CXG_DIFFEXP_MAX_WORKERS", dx.max_workers);
        dx.cpu_multiplier = env_usize(get, "CXG_DIFFEXP_CPU_MULTIPLIER", dx.cpu_multiplier);
        dx.target_work_unit = env_usize(get, "CXG_DIFFEXP_TARGET_WORK_UNIT", dx.target_work_unit);

        let f = &mut self.features;
        f.custom_colors = env_bool(get, "CXG_FEATURE_CUSTOM_COLORS", f.custom_colors);
        f.diffexp = env_bool(get, "CXG_FEATURE_DIFFEXP", f.diffexp);
        f.disable_diffexp_for_large = env_bool(
            get,
            "CXG_FEATURE_DISABLE_DIFFEXP_FOR_LARGE",
            f.disable_diffexp_for_large,
        );
        f.user_annotations = env_bool(get, "CXG_FEATURE_USER_ANNOTATIONS", f.user_annotations);
        f.genesets_readonly = env_bool(get, "CXG_FEATURE_GENESETS_READONLY", f.genesets_readonly);

        self.presentation.max_categories =
            env_usize(get, "CXG_MAX_CATEGORIES", self.presentation.max_categories);

        if let Some(v) = env_string(get, "CXG_STORE_HTTP_ENDPOINT") {
            self.store.http_endpoint = Some(v);
        }
        if let Some(v) = env_string(get, "CXG_STORE_BEARER") {
            self.store.bearer_token = Some(v);
        }
        self.store.retry.max_attempts =
            env_usize(get, "CXG_STORE_RETRY_ATTEMPTS", self.store.retry.max_attempts);
        self.store.retry.base_backoff_ms =
            env_u64(get, "CXG_STORE_RETRY_BACKOFF_MS", self.store.retry.base_backoff_ms);
        self.store.retry.max_backoff_ms =
            env_u64(get, "CXG_STORE_RETRY_MAX_BACKOFF_MS", self.store.retry.max_backoff_ms);

        if let Some(v) = env_string(get, "CXG_USER_HEADER") {
            self.auth.user_header = v.to_ascii_lowercase();
        }

        let http = &mut self.http;
        if let Some(v) = env_string(get, "CXG_BIND") {
            http.bind = v;
        }
        http.max_body_bytes = env_usize(get, "CXG_MAX_BODY_BYTES", http.max_body_bytes);
        http.enable_response_compression = env_bool(
            get,
            "CXG_RESPONSE_COMPRESSION",
            http.enable_response_compression,
        );
        http.compression_min_bytes =
            env_usize(get, "CXG_COMPRESSION_MIN_BYTES", http.compression_min_bytes);
        http.shutdown_drain_ms = env_u64(get, "CXG_SHUTDOWN_DRAIN_MS", http.shutdown_drain_ms);
    }
}

/// Rejects configurations the server cannot run with, before binding.
pub fn validate_startup_config(config: &ServerConfig) -> Result<(), CxgError> {
    if config.dataroots.is_empty() {
        return Err(CxgError::configuration("at least one dataroot is required"));
    }
    for (tag, dataroot) in &config.dataroots {
        if tag.is_empty() || tag.contains('/') || tag == "s3_uri" {
            return Err(CxgError::configuration(format!("invalid dataroot tag {tag:?}")));
        }
        parse_store_uri(&dataroot.root)
            .map_err(|e| CxgError::configuration(format!("dataroot {tag}: {e}")))?;
    }
    if config.cache.handles.max_entries == 0 || config.cache.resolver.max_entries == 0 {
        return Err(CxgError::configuration("cache capacities must be > 0"));
    }
    let limits = &config.limits.query;
    if limits.column_request_max == 0 || limits.diffexp_top_n == 0 {
        return Err(CxgError::configuration(
            "column_request_max and diffexp_top_n must be > 0",
        ));
    }
    if limits.diffexp_lfc_cutoff.is_nan() || limits.diffexp_lfc_cutoff < 0.0 {
        return Err(CxgError::configuration(
            "diffexp_lfc_cutoff must be a non-negative number",
        ));
    }
    let dx = &config.diffexp;
    if dx.max_workers == 0 || dx.cpu_multiplier == 0 || dx.target_work_unit == 0 {
        return Err(CxgError::configuration("diffexp pool settings must be > 0"));
    }
    if config.metadata_service.api_base.is_some() && config.metadata_service.web_base.is_none() {
        return Err(CxgError::configuration(
            "metadata_service.api_base requires metadata_service.web_base",
        ));
    }
    if config.auth.user_header.trim().is_empty() {
        return Err(CxgError::configuration("auth.user_header must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.dataroots.insert(
            "d".to_string(),
            DatarootConfig {
                root: "/data".to_string(),
                user_scoped: false,
            },
        );
        config
    }

    #[test]
    fn yaml_sections_fill_defaults() {
        let config = ServerConfig::from_yaml_str(
            "dataroots:\n  d:\n    root: s3://cells/prod\n  custom:\n    root: /custom\n    user_scoped: true\n\
             cache:\n  handles:\n    max_entries: 2\n\
             limits:\n  column_request_max: 5\n  response_max_bytes: 1024\n\
             features:\n  custom_colors: false\n",
        )
        .expect("yaml");
        assert_eq!(config.dataroots.len(), 2);
        assert!(config.dataroots["custom"].user_scoped);
        assert_eq!(config.cache.handles.max_entries, 2);
        assert_eq!(config.cache.handles.ttl_secs, Some(300));
        assert_eq!(config.limits.query.column_request_max, 5);
        assert_eq!(config.limits.query.diffexp_top_n, 10);
        assert_eq!(config.limits.response_max_bytes, Some(1024));
        assert!(!config.features.custom_colors);
        assert!(config.features.diffexp);
        assert_eq!(config.diffexp, DiffexConfig::default());
        validate_startup_config(&config).expect("valid");
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("CXG_DATAROOTS", "d=/data, u=/users"),
            ("CXG_USER_SCOPED_DATAROOTS", "u"),
            ("CXG_HANDLE_CACHE_MAX_ENTRIES", "3"),
            ("CXG_HANDLE_CACHE_TTL_SECS", "0"),
            ("CXG_FEATURE_DIFFEXP", "false"),
            ("CXG_DIFFEXP_MAX_WORKERS", "not-a-number"),
            ("CXG_USER_HEADER", "X-Auth-User"),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config.apply_env(&|name| vars.get(name).map(|v| (*v).to_string()));
        assert_eq!(config.dataroots["d"].root, "/data");
        assert!(config.dataroots["u"].user_scoped);
        assert_eq!(config.cache.handles.max_entries, 3);
        assert_eq!(config.cache.handles.ttl_secs, None);
        assert!(!config.features.diffexp);
        assert_eq!(config.diffexp.max_workers, 64);
        assert_eq!(config.auth.user_header, "x-auth-user");
    }

    #[test]
    fn startup_validation_rejects_broken_setups() {
        let err = validate_startup_config(&ServerConfig::default()).expect_err("no dataroots");
        assert!(err.to_string().contains("dataroot"));

        let mut config = valid();
        config.cache.handles.max_entries = 0;
        assert!(validate_startup_config(&config).is_err());

        let mut config = valid();
        config.dataroots.get_mut("d").expect("d").root = "gs://bucket/x".to_string();
        assert!(matches!(
            validate_startup_config(&config),
            Err(CxgError::Configuration(_))
        ));

        let mut config = valid();
        config.metadata_service.api_base = Some("http://meta".to_string());
        assert!(validate_startup_config(&config).is_err());

        let mut config = valid();
        config.limits.query.diffexp_lfc_cutoff = f64::NAN;
        assert!(validate_startup_config(&config).is_err());

        validate_startup_config(&valid()).expect("valid");
    }
}
