//! Ranking engine: score passing attempts and order them totally.
//!
//! Axes are normalized to [0,1] and combined by configured weights.
//! When the optional AI readability assessment is unavailable, a neutral
//! value is recorded and its weight is redistributed proportionally
//! across the other axes. Ties break deterministically: higher
//! confidence, then fewer changed lines, then earlier attempt id.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::models::{
    Attempt, RankingConfig, ScoreCard, Survivor, Verification,
};
use crate::domain::ports::Purpose;
use crate::infrastructure::ai::AiGateway;

use super::prompts;
use super::run_context::RunContext;

pub struct RankingEngine {
    config: RankingConfig,
    gateway: Option<Arc<AiGateway>>,
    call_deadline: Duration,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        Self {
            config,
            gateway: None,
            call_deadline: Duration::from_secs(30),
        }
    }

    /// Enable AI readability assessment.
    pub fn with_gateway(mut self, gateway: Arc<AiGateway>, call_deadline: Duration) -> Self {
        self.gateway = Some(gateway);
        self.call_deadline = call_deadline;
        self
    }

    /// Rank passing candidates and emit the top K as survivors with
    /// ranks 1..=K.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn rank(
        &self,
        intent_id: Uuid,
        candidates: Vec<(Attempt, Verification)>,
        ctx: &RunContext,
    ) -> Vec<Survivor> {
        let mut scored: Vec<(Attempt, Verification, ScoreCard)> = Vec::new();

        for (attempt, verification) in candidates {
            if !verification.passed {
                continue;
            }
            let readability = self.readability_of(&attempt, ctx).await;
            let score = self.score(&attempt, &verification, readability);
            debug!(
                attempt_id = %attempt.id,
                overall = score.overall,
                simplicity = score.simplicity,
                "candidate scored"
            );
            scored.push((attempt, verification, score));
        }

        scored.sort_by(|a, b| Self::order(&a.0, &a.2, &b.0, &b.2));

        scored
            .into_iter()
            .take(self.config.top_k)
            .enumerate()
            .map(|(i, (attempt, verification, score))| {
                Survivor::new(intent_id, attempt.id, verification.id, (i + 1) as u32, score)
            })
            .collect()
    }

    /// Compose the score card for one candidate.
    fn score(
        &self,
        attempt: &Attempt,
        verification: &Verification,
        readability: Option<f64>,
    ) -> ScoreCard {
        let assertions = if verification.assertions_total == 0 {
            1.0
        } else {
            verification.assertions_passed as f64 / verification.assertions_total as f64
        };
        let simplicity = simplicity_score(attempt.changed_lines(), attempt.max_nesting_depth());
        let performance = 1.0;

        // Effective weights: a missing readability score donates its
        // weight to the other axes, pro rata.
        let (w_assert, w_simpl, w_read, w_perf) = match readability {
            Some(_) => (
                self.config.weight_assertions,
                self.config.weight_simplicity,
                self.config.weight_readability,
                self.config.weight_performance,
            ),
            None => {
                let remainder = 1.0 - self.config.weight_readability;
                if remainder <= f64::EPSILON {
                    (1.0 / 3.0, 1.0 / 3.0, 0.0, 1.0 / 3.0)
                } else {
                    (
                        self.config.weight_assertions / remainder,
                        self.config.weight_simplicity / remainder,
                        0.0,
                        self.config.weight_performance / remainder,
                    )
                }
            }
        };

        let readability_value = readability.unwrap_or(0.5).clamp(0.0, 1.0);
        let overall = (assertions * w_assert
            + simplicity * w_simpl
            + readability_value * w_read
            + performance * w_perf)
            .clamp(0.0, 1.0);

        ScoreCard {
            assertions,
            simplicity,
            readability: readability_value,
            performance,
            overall,
        }
    }

    /// AI readability assessment, when enabled and reachable.
    async fn readability_of(&self, attempt: &Attempt, ctx: &RunContext) -> Option<f64> {
        if !self.config.readability_enabled {
            return None;
        }
        let gateway = self.gateway.as_ref()?;

        let contents: String = attempt
            .changes
            .iter()
            .filter_map(|c| {
                c.content
                    .as_deref()
                    .map(|body| format!("--- {}\n{body}\n", c.path))
            })
            .collect();

        let response = gateway
            .complete(
                prompts::score_prompt(&contents),
                Purpose::Score,
                self.call_deadline,
                &ctx.cancel,
                &ctx.ledger,
            )
            .await
            .ok()?;

        response.trim().parse::<f64>().ok().map(|v| v.clamp(0.0, 1.0))
    }

    /// Total deterministic order: overall descending, then confidence
    /// descending, then changed lines ascending, then attempt id.
    fn order(a_attempt: &Attempt, a: &ScoreCard, b_attempt: &Attempt, b: &ScoreCard) -> Ordering {
        b.overall
            .partial_cmp(&a.overall)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b_attempt
                    .confidence
                    .partial_cmp(&a_attempt.confidence)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a_attempt.changed_lines().cmp(&b_attempt.changed_lines()))
            .then_with(|| a_attempt.id.cmp(&b_attempt.id))
    }
}

/// Monotone decreasing in both changed lines and nesting depth, in (0,1].
fn simplicity_score(changed_lines: usize, max_depth: usize) -> f64 {
    1.0 / (1.0 + changed_lines as f64 / 150.0 + max_depth as f64 / 10.0)
}
