//! Bounded retry for persistence calls.
//!
//! Callers pass a closure that rebuilds the same request on every attempt, so
//! a retried insert carries the token allocated before the first attempt.

use super::repository::RepositoryError;
use crate::observability::metrics;
use common::types::QueueId;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n * backoff`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_PERSIST_MAX_ATTEMPTS,
            backoff: Duration::from_millis(crate::config::DEFAULT_PERSIST_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    queue_id: &QueueId,
    mut op: F,
) -> Result<T, RepositoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RepositoryError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                warn!(
                    target: "qs.store",
                    operation,
                    queue_id = %queue_id,
                    attempt,
                    max_attempts,
                    error = %err,
                    "Persistence call failed, retrying"
                );
                metrics::record_persistence_retry(operation);
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
