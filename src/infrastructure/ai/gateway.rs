//! The AI gateway: the single surface the pipeline uses to reach a
//! completion backend.
//!
//! Composes, per call: cost admission against the run's ledger, an
//! outstanding-call permit from the adaptive limiter, the call deadline,
//! cancellation, and the retry policy. Every call is tagged with a
//! purpose for accounting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::AiConfig;
use crate::domain::ports::{
    CompletionClient, CompletionError, CompletionRequest, CompletionResponse, Purpose,
};

use super::cost::{price_for, CostLedger};
use super::limiter::AdaptiveLimiter;
use super::retry::RetryPolicy;

/// Per-purpose call and cost tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PurposeUsage {
    pub calls: u64,
    pub cost_usd: f64,
}

pub struct AiGateway {
    client: Arc<dyn CompletionClient>,
    limiter: Arc<AdaptiveLimiter>,
    retry: RetryPolicy,
    max_tokens: u32,
    fallback_call_cost_usd: f64,
    usage: Mutex<HashMap<Purpose, PurposeUsage>>,
}

impl AiGateway {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        config: &AiConfig,
        fallback_call_cost_usd: f64,
    ) -> Self {
        Self {
            client,
            limiter: AdaptiveLimiter::new(
                config.max_outstanding,
                Duration::from_secs(config.cooldown_secs),
            ),
            retry: RetryPolicy::new(
                config.max_retries,
                config.initial_backoff_ms,
                config.max_backoff_ms,
            ),
            max_tokens: config.max_tokens,
            fallback_call_cost_usd,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// One completion call: admitted against the ledger, bounded by the
    /// limiter, deadline, and cancellation, retried on transient failure.
    #[instrument(skip(self, prompt, cancel, ledger), fields(purpose = %purpose))]
    pub async fn complete(
        &self,
        prompt: String,
        purpose: Purpose,
        deadline: Duration,
        cancel: &CancellationToken,
        ledger: &CostLedger,
    ) -> PipelineResult<String> {
        ledger.admit()?;

        let _permit = match self.limiter.acquire(cancel).await {
            Ok(permit) => permit,
            Err(err) => {
                ledger.abandon();
                return Err(err);
            }
        };

        let outcome = self
            .retry
            .execute(|| self.one_call(&prompt, purpose, deadline, cancel))
            .await;
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                ledger.abandon();
                return Err(match err {
                    CompletionError::Canceled => PipelineError::Canceled,
                    CompletionError::Permanent(msg) => PipelineError::AiUnavailable(msg),
                    other => PipelineError::AiTransient(other.to_string()),
                });
            }
        };

        let cost = price_for(&response.model, response.input_tokens, response.output_tokens)
            .unwrap_or(self.fallback_call_cost_usd);
        ledger.record(cost);
        {
            let mut usage = self.usage.lock().expect("usage lock poisoned");
            let entry = usage.entry(purpose).or_default();
            entry.calls += 1;
            entry.cost_usd += cost;
        }

        debug!(
            purpose = %purpose,
            cost_usd = cost,
            output_tokens = response.output_tokens,
            "completion finished"
        );

        Ok(response.text)
    }

    async fn one_call(
        &self,
        prompt: &str,
        purpose: Purpose,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, CompletionError> {
        let request = CompletionRequest {
            prompt: prompt.to_string(),
            purpose,
            max_tokens: self.max_tokens,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(CompletionError::Canceled),
            outcome = timeout(deadline, self.client.complete(request)) => {
                match outcome {
                    Ok(inner) => inner,
                    Err(_elapsed) => Err(CompletionError::DeadlineExceeded),
                }
            }
        };

        if matches!(result, Err(CompletionError::RateLimited)) {
            self.limiter.on_rate_limited();
        }
        result
    }

    /// Snapshot of per-purpose usage for status reporting.
    pub fn usage_by_purpose(&self) -> HashMap<Purpose, PurposeUsage> {
        self.usage.lock().expect("usage lock poisoned").clone()
    }

    /// Current outstanding-call ceiling, after any rate-limit reductions.
    pub fn effective_concurrency(&self) -> usize {
        self.limiter.effective_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedClient {
        rate_limits_before_success: AtomicU32,
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            if self
                .rate_limits_before_success
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CompletionError::RateLimited);
            }
            Ok(CompletionResponse {
                text: format!("echo: {}", request.prompt),
                model: "claude-sonnet-4-5".into(),
                input_tokens: 100,
                output_tokens: 50,
            })
        }
    }

    fn gateway(client: ScriptedClient) -> AiGateway {
        AiGateway::new(
            Arc::new(client),
            &AiConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                ..AiConfig::default()
            },
            0.05,
        )
    }

    #[tokio::test]
    async fn completes_and_records_cost() {
        let gateway = gateway(ScriptedClient {
            rate_limits_before_success: AtomicU32::new(0),
        });
        let ledger = CostLedger::new(10.0, 0.05);
        let cancel = CancellationToken::new();

        let text = gateway
            .complete(
                "hi".into(),
                Purpose::Parse,
                Duration::from_secs(5),
                &cancel,
                &ledger,
            )
            .await
            .unwrap();

        assert_eq!(text, "echo: hi");
        assert!(ledger.spent_usd() > 0.0);
        assert_eq!(gateway.usage_by_purpose()[&Purpose::Parse].calls, 1);
    }

    #[tokio::test]
    async fn rate_limit_reduces_concurrency_then_succeeds() {
        let gateway = gateway(ScriptedClient {
            rate_limits_before_success: AtomicU32::new(2),
        });
        let ledger = CostLedger::new(10.0, 0.05);
        let cancel = CancellationToken::new();
        let before = gateway.effective_concurrency();

        let text = gateway
            .complete(
                "hi".into(),
                Purpose::Implement,
                Duration::from_secs(5),
                &cancel,
                &ledger,
            )
            .await
            .unwrap();

        assert_eq!(text, "echo: hi");
        assert!(gateway.effective_concurrency() < before);
    }

    #[tokio::test]
    async fn ceiling_refuses_before_calling() {
        let gateway = gateway(ScriptedClient {
            rate_limits_before_success: AtomicU32::new(0),
        });
        let ledger = CostLedger::new(0.01, 0.30);
        let cancel = CancellationToken::new();

        let err = gateway
            .complete(
                "hi".into(),
                Purpose::Implement,
                Duration::from_secs(5),
                &cancel,
                &ledger,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CostCeilingReached { .. }));
        assert_eq!(ledger.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_promptly() {
        let gateway = gateway(ScriptedClient {
            rate_limits_before_success: AtomicU32::new(0),
        });
        let ledger = CostLedger::new(10.0, 0.05);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = gateway
            .complete(
                "hi".into(),
                Purpose::Parse,
                Duration::from_secs(5),
                &cancel,
                &ledger,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Canceled));
    }
}
