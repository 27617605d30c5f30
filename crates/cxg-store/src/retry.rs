// SPDX-License-Identifier: Apache-2.0

//! Retry loop for remote store reads.

use crate::error::{StoreError, StoreErrorCode};
use serde::Deserialize;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first included. Zero behaves like one.
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    /// Ceiling for the doubled delay.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 2_000,
        }
    }
}

/// Result of one attempt: either the read is over, or it may succeed later.
#[derive(Debug)]
pub enum Attempt<T> {
    Done(Result<T, StoreError>),
    Transient(StoreError),
}

/// Statuses an object store returns for conditions that clear on their own.
#[must_use]
pub const fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): the base doubled per
    /// retry, capped at `max_backoff_ms`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX).min(16);
        let ms = self
            .base_backoff_ms
            .saturating_mul(1_u64 << shift)
            .min(self.max_backoff_ms.max(self.base_backoff_ms));
        Duration::from_millis(ms)
    }

    /// Runs `attempt` until it is done or the attempt budget is spent. The
    /// last transient error is returned as a network error naming `what`.
    pub fn run<T>(
        &self,
        what: &str,
        mut attempt: impl FnMut() -> Attempt<T>,
    ) -> Result<T, StoreError> {
        let budget = self.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match attempt() {
                Attempt::Done(result) => return result,
                Attempt::Transient(err) if retry + 1 >= budget => {
                    return Err(StoreError::new(
                        StoreErrorCode::Network,
                        format!("{what}: gave up after {budget} attempts: {}", err.message),
                    ));
                }
                Attempt::Transient(err) => {
                    retry += 1;
                    let delay = self.delay_for_retry(retry);
                    tracing::warn!(
                        what,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying store read"
                    );
                    thread::sleep(delay);
                }
            }
        }
    }
}
