//! Bounded retry for backend calls.
//!
//! Only backend failures come through here. Logical outcomes (a conflict, a
//! lost lease) are plain `Ok` values from the store's point of view and are
//! never retried.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::{LeaseError, StoreError};

/// Exponential backoff with a per-call timeout.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Total tries, the first one included.
    pub attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// A call that takes longer is abandoned and counted as `StoreError::Timeout`.
    pub call_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// A backend call that failed on every try (or with a non-retryable error).
#[derive(Debug, thiserror::Error)]
#[error("{op} failed after {attempts} attempt(s): {source}")]
pub struct RetriesExhausted {
    pub op: &'static str,
    pub attempts: u32,
    #[source]
    pub source: StoreError,
}

impl From<RetriesExhausted> for LeaseError {
    fn from(err: RetriesExhausted) -> Self {
        LeaseError::Backend {
            attempts: err.attempts,
            source: err.source,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempts`-th failure: `base_delay * multiplier^(attempts - 1)`.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempts.saturating_sub(1) as i32);
        Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
    }

    /// Run `call` until it succeeds, fails permanently, or tries run out.
    pub async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, RetriesExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => StoreError::Timeout {
                    op,
                    after: self.call_timeout,
                },
            };

            if !err.is_retryable() || attempts >= max_attempts {
                return Err(RetriesExhausted {
                    op,
                    attempts,
                    source: err,
                });
            }

            let delay = err
                .retry_after()
                .map_or(self.next_delay(attempts), |hint| hint.max(self.next_delay(attempts)));
            warn!(op, attempts, error = %err, delay_ms = delay.as_millis() as u64, "backend call failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }
}
