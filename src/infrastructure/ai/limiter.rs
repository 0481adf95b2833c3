//! Adaptive concurrency limiter for outstanding completion calls.
//!
//! Holds a global ceiling on in-flight calls. A rate-limit signal halves
//! the effective limit for a cooldown window; after the window the limit
//! recovers linearly, one slot per recovery interval, back to the ceiling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{PipelineError, PipelineResult};

struct LimiterState {
    limit: usize,
    in_flight: usize,
    /// While set, the limit stays reduced; recovery starts when it passes.
    cooldown_until: Option<Instant>,
    last_recovery: Option<Instant>,
}

pub struct AdaptiveLimiter {
    max: usize,
    cooldown: Duration,
    /// One slot is restored per this interval once the cooldown has passed.
    recovery_interval: Duration,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl AdaptiveLimiter {
    pub fn new(max: usize, cooldown: Duration) -> Arc<Self> {
        let max = max.max(1);
        let recovery_interval = cooldown.checked_div(max as u32).unwrap_or(cooldown).max(Duration::from_millis(100));
        Arc::new(Self {
            max,
            cooldown,
            recovery_interval,
            state: Mutex::new(LimiterState {
                limit: max,
                in_flight: 0,
                cooldown_until: None,
                last_recovery: None,
            }),
            released: Notify::new(),
        })
    }

    /// Current effective limit on outstanding calls.
    pub fn effective_limit(&self) -> usize {
        self.state.lock().expect("limiter lock poisoned").limit
    }

    /// Acquire a slot, waiting for one to free when the limit is reached.
    /// Cancellation is honored while waiting.
    pub async fn acquire(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> PipelineResult<LimiterPermit> {
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Canceled);
            }
            self.recover_if_due();

            {
                let mut state = self.state.lock().expect("limiter lock poisoned");
                if state.in_flight < state.limit {
                    state.in_flight += 1;
                    return Ok(LimiterPermit {
                        limiter: Arc::clone(self),
                    });
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Canceled),
                _ = self.released.notified() => {}
                // Re-check periodically so recovery can unblock waiters even
                // when no permit is released.
                _ = tokio::time::sleep(self.recovery_interval) => {}
            }
        }
    }

    /// React to a rate-limit signal: halve the effective limit and start
    /// a cooldown window.
    pub fn on_rate_limited(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let halved = (state.limit / 2).max(1);
        if halved < state.limit {
            warn!(
                from = state.limit,
                to = halved,
                cooldown_secs = self.cooldown.as_secs(),
                "rate limited; halving outstanding-call concurrency"
            );
            state.limit = halved;
        }
        state.cooldown_until = Some(Instant::now() + self.cooldown);
        state.last_recovery = None;
    }

    /// Restore slots linearly once the cooldown window has passed.
    fn recover_if_due(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let Some(cooldown_until) = state.cooldown_until else {
            return;
        };
        let now = Instant::now();
        if now < cooldown_until {
            return;
        }

        let since = state.last_recovery.unwrap_or(cooldown_until);
        let steps = (now.duration_since(since).as_millis()
            / self.recovery_interval.as_millis().max(1)) as usize;
        if steps == 0 {
            return;
        }

        let restored = (state.limit + steps).min(self.max);
        if restored > state.limit {
            debug!(from = state.limit, to = restored, "recovering concurrency");
            state.limit = restored;
        }
        state.last_recovery = Some(now);
        if state.limit == self.max {
            state.cooldown_until = None;
            state.last_recovery = None;
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        state.in_flight = state.in_flight.saturating_sub(1);
        drop(state);
        self.released.notify_one();
    }
}

/// A held concurrency slot; dropping it releases the slot.
pub struct LimiterPermit {
    limiter: Arc<AdaptiveLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquires_up_to_limit() {
        let limiter = AdaptiveLimiter::new(2, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let a = limiter.acquire(&cancel).await.unwrap();
        let _b = limiter.acquire(&cancel).await.unwrap();

        // Third acquire must wait until a permit is released.
        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rate_limit_halves_effective_limit() {
        let limiter = AdaptiveLimiter::new(8, Duration::from_secs(60));
        limiter.on_rate_limited();
        assert_eq!(limiter.effective_limit(), 4);
        limiter.on_rate_limited();
        assert_eq!(limiter.effective_limit(), 2);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.effective_limit(), 1, "never drops below one");
    }

    #[tokio::test]
    async fn recovery_restores_limit_after_cooldown() {
        let limiter = AdaptiveLimiter::new(4, Duration::from_millis(400));
        limiter.on_rate_limited();
        assert_eq!(limiter.effective_limit(), 2);

        // Past cooldown plus several recovery intervals.
        tokio::time::sleep(Duration::from_millis(800)).await;
        limiter.recover_if_due();
        assert!(limiter.effective_limit() > 2);
    }

    #[tokio::test]
    async fn cancellation_interrupts_waiters() {
        let limiter = AdaptiveLimiter::new(1, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Canceled)));
    }
}
