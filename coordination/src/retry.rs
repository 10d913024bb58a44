//! Retry with exponential backoff for persistence calls
//!
//! Every persistence call gets its own timeout and is retried only while the
//! failure is transient (`StoreError::Unavailable` or a call timeout).
//!
//! # Usage
//!
//! ```rust,ignore
//! use cycle_coordination::retry::{with_retry, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! with_retry(&policy, "save_session", || store.save_session(&session)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::state::{StoreError, StoreResult};

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for exponential).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Timeout for a single call in milliseconds (0 = unlimited).
    pub call_timeout_ms: u64,
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate the backoff delay for a given attempt number (0-indexed).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let delay =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another retry is allowed given the attempt count.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Get the backoff as a Duration for a given attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(attempt))
    }

    /// Per-call timeout, if bounded.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 retries, 200ms initial backoff, 2x multiplier, 5s max, 10s per call.
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
            max_backoff_ms: 5_000,
            call_timeout_ms: 10_000,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or retries are exhausted.
///
/// Returns the last error on exhaustion.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        let result = match policy.call_timeout() {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "{op_name} timed out after {}ms",
                    limit.as_millis()
                ))),
            },
            None => op().await,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if !policy.should_retry(attempt) {
            error!(op = op_name, attempts = attempt + 1, error = %err, "Persistence retries exhausted");
            return Err(err);
        }

        attempt += 1;
        let backoff = policy.backoff_duration(attempt);
        warn!(
            op = op_name,
            attempt,
            max_retries = policy.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Transient persistence error, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}
