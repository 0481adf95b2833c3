//! Generation swarm: fan out N implementation attempts across
//! strategies with bounded parallelism, a cost ceiling, and dedup.
//!
//! Partial failure is the normal case: invalid or malformed attempts
//! are discarded without failing siblings, and a mid-batch cost ceiling
//! stops new submissions while outstanding tasks drain. The swarm
//! always returns whatever survived.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::PipelineError;
use crate::domain::models::{
    Attempt, EventSender, FileChange, GenerationConfig, PipelineEvent, Specification, Strategy,
};
use crate::domain::ports::Purpose;
use crate::infrastructure::ai::AiGateway;

use super::prompts;
use super::run_context::RunContext;

#[derive(Debug, Deserialize)]
struct ImplementDraft {
    changes: Vec<FileChange>,
    #[serde(default)]
    approach: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// What one batch produced.
#[derive(Debug, Default)]
pub struct SwarmOutcome {
    /// Valid, deduplicated attempts in arrival order.
    pub attempts: Vec<Attempt>,
    pub discarded: u32,
    pub deduplicated: u32,
    pub ceiling_hit: bool,
}

enum TaskOutcome {
    Produced(Attempt),
    Discarded,
    Stopped,
}

pub struct GenerationSwarm {
    gateway: Arc<AiGateway>,
    config: GenerationConfig,
    call_deadline: Duration,
}

impl GenerationSwarm {
    pub fn new(gateway: Arc<AiGateway>, config: GenerationConfig, call_deadline: Duration) -> Self {
        Self {
            gateway,
            config,
            call_deadline,
        }
    }

    /// Run one generation batch against a specification.
    #[instrument(skip_all, fields(spec_id = %spec.id, version = spec.version))]
    pub async fn generate(
        &self,
        spec: &Specification,
        ctx: &RunContext,
        events: &EventSender,
    ) -> SwarmOutcome {
        let mut outcome = SwarmOutcome::default();
        let stop = Arc::new(AtomicBool::new(false));

        // Expand the distribution into (strategy, ordinal) pairs, capped
        // at the configured maximum.
        let mut pairs: Vec<Strategy> = Vec::new();
        for (strategy, count) in self.config.strategy_counts() {
            for _ in 0..count {
                pairs.push(strategy);
            }
        }
        pairs.truncate(self.config.max_count as usize);

        let (mutation_pairs, direct_pairs): (Vec<_>, Vec<_>) =
            pairs.into_iter().partition(|s| *s == Strategy::Mutation);

        info!(
            direct = direct_pairs.len(),
            mutation = mutation_pairs.len(),
            "starting generation batch"
        );

        // Direct strategies run first; mutation needs a completed sibling.
        let direct: Vec<(Strategy, Option<String>)> =
            direct_pairs.into_iter().map(|s| (s, None)).collect();
        self.run_wave(spec, direct, ctx, events, &stop, &mut outcome)
            .await;

        if !mutation_pairs.is_empty() {
            let sibling = outcome.attempts.first().map(|a| a.approach.clone());
            let wave: Vec<(Strategy, Option<String>)> = mutation_pairs
                .into_iter()
                .map(|_| match &sibling {
                    // No completed sibling: mutation downgrades to vanilla.
                    None => (Strategy::Vanilla, None),
                    Some(approach) => (Strategy::Mutation, Some(approach.clone())),
                })
                .collect();
            self.run_wave(spec, wave, ctx, events, &stop, &mut outcome)
                .await;
        }

        // Batch-wide dedup by content hash, earliest arrival wins.
        let mut seen = HashSet::new();
        let before = outcome.attempts.len();
        outcome.attempts.retain(|a| seen.insert(a.content_hash()));
        outcome.deduplicated = (before - outcome.attempts.len()) as u32;

        if outcome.deduplicated > 0 && outcome.attempts.len() == 1 {
            events.emit(PipelineEvent::LowDiversity {
                intent_id: spec.intent_id,
            });
        }

        outcome.ceiling_hit = stop.load(Ordering::SeqCst);
        info!(
            produced = outcome.attempts.len(),
            discarded = outcome.discarded,
            deduplicated = outcome.deduplicated,
            ceiling_hit = outcome.ceiling_hit,
            "generation batch complete"
        );
        outcome
    }

    /// Run one wave of tasks and fold results into the outcome in
    /// completion order.
    async fn run_wave(
        &self,
        spec: &Specification,
        wave: Vec<(Strategy, Option<String>)>,
        ctx: &RunContext,
        events: &EventSender,
        stop: &Arc<AtomicBool>,
        outcome: &mut SwarmOutcome,
    ) {
        let mut tasks = JoinSet::new();

        for (strategy, sibling) in wave {
            let gateway = self.gateway.clone();
            let ctx = ctx.clone();
            let events = events.clone();
            let stop = stop.clone();
            let spec = spec.clone();
            let deadline = self.call_deadline;
            let prompt = prompts::implement_prompt(&spec, strategy, sibling.as_deref());

            tasks.spawn(async move {
                one_attempt(gateway, spec, strategy, prompt, deadline, ctx, events, stop).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(TaskOutcome::Produced(attempt)) => outcome.attempts.push(attempt),
                Ok(TaskOutcome::Discarded) => outcome.discarded += 1,
                Ok(TaskOutcome::Stopped) => {}
                Err(e) => {
                    warn!(error = %e, "generation task panicked");
                    outcome.discarded += 1;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn one_attempt(
    gateway: Arc<AiGateway>,
    spec: Specification,
    strategy: Strategy,
    prompt: String,
    deadline: Duration,
    ctx: RunContext,
    events: EventSender,
    stop: Arc<AtomicBool>,
) -> TaskOutcome {
    if stop.load(Ordering::SeqCst) || ctx.is_canceled() {
        return TaskOutcome::Stopped;
    }

    let response = match gateway
        .complete(prompt, Purpose::Implement, deadline, &ctx.cancel, &ctx.ledger)
        .await
    {
        Ok(text) => text,
        Err(PipelineError::CostCeilingReached { spent_usd, .. }) => {
            // First observer stops further submissions; the rest drain.
            if !stop.swap(true, Ordering::SeqCst) {
                events.emit(PipelineEvent::CostCeilingReached {
                    intent_id: spec.intent_id,
                    spent_usd,
                });
            }
            return TaskOutcome::Stopped;
        }
        Err(PipelineError::Canceled) => return TaskOutcome::Stopped,
        Err(err) => {
            debug!(strategy = %strategy, error = %err, "generation call failed");
            events.emit(PipelineEvent::AttemptDiscarded {
                strategy,
                reason: err.to_string(),
            });
            return TaskOutcome::Discarded;
        }
    };

    let draft: ImplementDraft = match prompts::extract_json(&response)
        .ok_or_else(|| "no JSON in response".to_string())
        .and_then(|json| serde_json::from_str(json).map_err(|e| e.to_string()))
    {
        Ok(draft) => draft,
        Err(reason) => {
            events.emit(PipelineEvent::AttemptDiscarded {
                strategy,
                reason: format!("malformed response: {reason}"),
            });
            return TaskOutcome::Discarded;
        }
    };

    let attempt = Attempt::new(
        spec.id.clone(),
        spec.version,
        strategy,
        draft.changes,
        draft.approach,
        draft.confidence,
    );

    if let Err(reason) = attempt.validate_against(&spec) {
        events.emit(PipelineEvent::AttemptDiscarded { strategy, reason });
        return TaskOutcome::Discarded;
    }

    events.emit(PipelineEvent::AttemptGenerated {
        attempt_id: attempt.id,
        strategy,
    });
    TaskOutcome::Produced(attempt)
}
