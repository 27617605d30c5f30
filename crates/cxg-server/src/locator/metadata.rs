// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use cxg_core::CxgError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Record returned by the dataset metadata service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DatasetMeta {
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub collection_visibility: Option<String>,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub s3_uri: Option<String>,
    #[serde(default)]
    pub tombstoned: bool,
}

/// Looks up dataset metadata by the dataset's public explorer URL.
///
/// `Ok(None)` means the service answered but knows no such dataset.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    async fn dataset_meta(&self, url: &str) -> Result<Option<DatasetMeta>, CxgError>;
}

pub struct HttpMetadataClient {
    api_base: String,
    client: reqwest::Client,
}

impl HttpMetadataClient {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, CxgError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CxgError::configuration(format!("metadata client: {e}")))?;
        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn dataset_meta(&self, url: &str) -> Result<Option<DatasetMeta>, CxgError> {
        let response = self
            .client
            .get(format!("{}/datasets/meta", self.api_base))
            .query(&[("url", url)])
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| CxgError::DatasetMetadata(format!("metadata request failed: {e}")))?;
        match response.status() {
            StatusCode::OK => response
                .json::<DatasetMeta>()
                .await
                .map(Some)
                .map_err(|e| CxgError::DatasetMetadata(format!("metadata body: {e}"))),
            StatusCode::NOT_FOUND => Ok(None),
            other => Err(CxgError::DatasetMetadata(format!(
                "metadata service answered {other}"
            ))),
        }
    }
}
