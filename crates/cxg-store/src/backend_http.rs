// SPDX-License-Identifier: Apache-2.0

use crate::backend::{short_object, StorageBackend, GROUP_INDEX};
use crate::error::{StoreError, StoreErrorCode};
use crate::retry::{is_transient_status, Attempt, RetryPolicy};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::RANGE;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Read-only backend for stores served over HTTP(S), including object stores
/// exposed through an S3-compatible endpoint.
#[derive(Clone)]
pub struct HttpBackend {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub retry: RetryPolicy,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GroupIndex {
    members: Vec<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                StoreError::new(StoreErrorCode::Configuration, format!("http client: {e}"))
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            retry: RetryPolicy::default(),
            client,
        })
    }

    #[must_use]
    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let req = self.client.get(url);
        match &self.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// One GET with retries. `range` adds a `Range` header; servers that
    /// ignore it answer 200 with the whole object.
    fn fetch(&self, key: &str, range: Option<(u64, u64)>) -> Result<(StatusCode, Vec<u8>), StoreError> {
        let url = self.object_url(key);
        self.retry.run(&url, || {
            let started = Instant::now();
            let mut req = self.request(&url);
            if let Some((offset, len)) = range {
                req = req.header(RANGE, format!("bytes={offset}-{}", offset + len - 1));
            }
            let resp = match req.send() {
                Ok(resp) => resp,
                Err(e) => {
                    return Attempt::Transient(StoreError::new(StoreErrorCode::Network, e.to_string()))
                }
            };
            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Attempt::Done(Err(StoreError::not_found(format!("object not found: {url}"))));
            }
            if status == StatusCode::RANGE_NOT_SATISFIABLE {
                return Attempt::Done(Ok((status, Vec::new())));
            }
            if is_transient_status(status.as_u16()) {
                return Attempt::Transient(StoreError::new(
                    StoreErrorCode::Network,
                    format!("store returned {status}"),
                ));
            }
            if !status.is_success() {
                return Attempt::Done(Err(StoreError::new(
                    StoreErrorCode::Network,
                    format!("store rejected {url}: {status}"),
                )));
            }
            match resp.bytes() {
                Ok(bytes) => {
                    tracing::debug!(
                        url = %url,
                        bytes = bytes.len(),
                        ranged = range.is_some(),
                        latency_ms = started.elapsed().as_millis() as u64,
                        "store object fetched"
                    );
                    Attempt::Done(Ok((status, bytes.to_vec())))
                }
                Err(e) => Attempt::Transient(StoreError::new(StoreErrorCode::Network, e.to_string())),
            }
        })
    }
}

impl StorageBackend for HttpBackend {
    fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        Ok(self.fetch(key, None)?.1)
    }

    fn read_range(&self, key: &str, offset: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (status, body) = self.fetch(key, Some((offset, len)))?;
        let url = self.object_url(key);
        let slice = match status {
            StatusCode::PARTIAL_CONTENT => Some(body.as_slice()),
            StatusCode::RANGE_NOT_SATISFIABLE => None,
            _ => usize::try_from(offset)
                .ok()
                .and_then(|start| body.get(start..)),
        };
        match slice {
            Some(bytes) if bytes.len() as u64 >= len => Ok(bytes[..len as usize].to_vec()),
            Some(bytes) => Err(short_object(&url, offset, len, offset + bytes.len() as u64)),
            None => Err(short_object(&url, offset, len, body.len() as u64)),
        }
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.fetch(key, None) {
            Ok(_) => Ok(true),
            Err(err) if err.code == StoreErrorCode::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let key = format!("{}/{GROUP_INDEX}", prefix.trim_end_matches('/'));
        let index: GroupIndex = serde_json::from_slice(&self.fetch(&key, None)?.1)?;
        let mut members = index.members;
        members.sort();
        Ok(members)
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
