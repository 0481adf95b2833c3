//! Retry policy for transient completion failures.
//!
//! Exponential backoff with jitter, bounded by a retry budget. Permanent
//! errors and cancellation return immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::ports::CompletionError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: initial_backoff_ms.max(1),
            max_backoff_ms: max_backoff_ms.max(initial_backoff_ms.max(1)),
        }
    }

    /// Execute an operation, retrying transient failures with backoff.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T, CompletionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CompletionError>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "completion succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let backoff = self.backoff_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient completion failure, retrying"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `min(initial * 2^attempt, max)` plus up to 25% jitter, so a burst
    /// of failed callers does not retry in lockstep.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1_000, 60_000)
    }
}
