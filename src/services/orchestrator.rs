//! Pipeline orchestrator.
//!
//! Drives the phase state machine for each intent:
//!
//! ```text
//! parsing → clarifying* → compiling → generating → verifying → ranking
//!         → judging → {complete | failed | aborted}
//! ```
//!
//! Every transition is persisted before the next phase's side effects
//! begin, so a crash mid-phase leaves the intent resumable at the phase
//! boundary. Startup recovery re-runs each unfinished intent's current
//! phase from its persisted input, sweeping leftover workspaces when
//! the phase was workspace-bound.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{
    Attempt, AttemptStatus, Decision, EventSender, Intent, IntentStatus, Judgment, ManifestConfig,
    PipelineEvent, Specification, Survivor, Verification,
};
use crate::domain::ports::Store;
use crate::infrastructure::ai::CostLedger;
use crate::infrastructure::workspace::WorkspaceManager;

use super::change_applier::ChangeApplier;
use super::generation_swarm::GenerationSwarm;
use super::intent_compiler::IntentCompiler;
use super::ranking::RankingEngine;
use super::run_context::RunContext;
use super::run_report::{PipelineReport, SurvivorRow};
use super::verification_harness::VerificationHarness;

/// What a pipeline run (or resumption) produced.
#[derive(Debug)]
pub enum RunOutcome {
    /// Parsing surfaced questions only the requester can answer.
    Clarification {
        intent_id: Uuid,
        questions: Vec<String>,
    },
    /// Survivors are presented; the pipeline waits for a judgment.
    AwaitingJudgment {
        intent_id: Uuid,
        survivors: Vec<Survivor>,
    },
    /// Zero attempts survived verification. A successful outcome, not
    /// an error; the report aggregates why.
    NoSurvivors {
        intent_id: Uuid,
        report: FailureReport,
    },
    /// The pipeline hit a terminal condition.
    Failed {
        intent_id: Uuid,
        phase: IntentStatus,
        reason: String,
    },
    Aborted {
        intent_id: Uuid,
    },
}

/// Human-facing summary of why no attempt survived.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub phase: IntentStatus,
    /// Top failure reasons with how many attempts hit each.
    pub reasons: Vec<(String, usize)>,
    pub suggestion: String,
}

impl FailureReport {
    pub fn render(&self) -> String {
        let mut out = format!("No surviving attempts (phase: {}).\n", self.phase);
        for (reason, count) in &self.reasons {
            out.push_str(&format!("  {count} attempt(s): {reason}\n"));
        }
        out.push_str(&self.suggestion);
        out
    }
}

/// Result of handling one judgment.
#[derive(Debug)]
pub enum JudgmentOutcome {
    /// The accepted survivor was applied to the project tree.
    Applied { intent_id: Uuid },
    /// A refinement re-entered the pipeline; here is where it landed.
    Continued(RunOutcome),
    /// A fresh intent replaced the current one.
    Redirected {
        new_intent_id: Uuid,
        outcome: RunOutcome,
    },
    Aborted { intent_id: Uuid },
}

pub struct Orchestrator<S: Store> {
    store: Arc<S>,
    compiler: IntentCompiler,
    swarm: GenerationSwarm,
    harness: Arc<VerificationHarness>,
    ranking: RankingEngine,
    applier: ChangeApplier,
    workspaces: Arc<WorkspaceManager>,
    config: ManifestConfig,
    events: EventSender,
    /// Cancellation handles for intents currently being driven.
    active: Arc<RwLock<HashMap<Uuid, RunContext>>>,
}

impl<S: Store> Orchestrator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        compiler: IntentCompiler,
        swarm: GenerationSwarm,
        harness: Arc<VerificationHarness>,
        ranking: RankingEngine,
        applier: ChangeApplier,
        workspaces: Arc<WorkspaceManager>,
        config: ManifestConfig,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            compiler,
            swarm,
            harness,
            ranking,
            applier,
            workspaces,
            config,
            events,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Accept `{message, session_id}` from the host and run the pipeline
    /// until it needs the human.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn submit(
        &self,
        message: impl Into<String>,
        session_id: Uuid,
    ) -> PipelineResult<RunOutcome> {
        let mut intent = Intent::new(session_id, message.into());
        self.store.save_intent(&intent).await?;
        info!(intent_id = %intent.id, "intent accepted");
        self.drive(&mut intent).await
    }

    /// Recover every unfinished intent after a restart. Workspace-bound
    /// phases get their leftover workspaces swept first.
    pub async fn resume_all(&self) -> PipelineResult<Vec<RunOutcome>> {
        let unfinished = self.store.list_unfinished_intents().await?;
        let mut outcomes = Vec::with_capacity(unfinished.len());
        for mut intent in unfinished {
            info!(intent_id = %intent.id, phase = %intent.status, "resuming intent");
            if intent.status == IntentStatus::Verifying {
                self.workspaces.sweep_orphans().await?;
            }
            outcomes.push(self.drive(&mut intent).await?);
        }
        Ok(outcomes)
    }

    /// Answer the open questions of a clarifying intent and re-enter
    /// parsing.
    pub async fn supply_clarifications(
        &self,
        intent_id: Uuid,
        answers: Vec<String>,
    ) -> PipelineResult<RunOutcome> {
        let mut intent = self.load_intent(intent_id).await?;
        if intent.status != IntentStatus::Clarifying {
            return Err(PipelineError::InvalidPhaseTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Parsing.to_string(),
            });
        }

        intent.raw_message.push_str("\n\nClarifications:\n");
        for answer in &answers {
            intent.raw_message.push_str(&format!("- {answer}\n"));
        }
        intent.status = IntentStatus::Parsing;
        self.store.update_intent(&intent).await?;
        self.drive(&mut intent).await
    }

    /// Handle the human's decision over the presented survivors.
    #[instrument(skip(self, judgment), fields(intent_id = %judgment.intent_id, decision = %judgment.decision))]
    pub async fn handle_judgment(&self, judgment: Judgment) -> PipelineResult<JudgmentOutcome> {
        judgment.validate().map_err(PipelineError::Validation)?;
        let mut intent = self.load_intent(judgment.intent_id).await?;

        self.events.emit(PipelineEvent::JudgmentReceived {
            intent_id: intent.id,
            decision: judgment.decision,
        });

        match judgment.decision {
            Decision::Accept => self.accept(&mut intent, judgment).await,
            Decision::Refine => self.refine(&mut intent, judgment).await,
            Decision::Redirect => self.redirect(&mut intent, judgment).await,
            Decision::Abort => {
                self.store.save_judgment(&judgment).await?;
                self.abort_intent(intent.id).await?;
                Ok(JudgmentOutcome::Aborted {
                    intent_id: intent.id,
                })
            }
        }
    }

    /// Cancel an intent: stop new AI calls, cancel outstanding ones,
    /// terminate workspace subprocesses, release workspaces.
    pub async fn abort_intent(&self, intent_id: Uuid) -> PipelineResult<()> {
        if let Some(ctx) = self.active.read().await.get(&intent_id) {
            ctx.cancel();
        }

        let mut intent = self.load_intent(intent_id).await?;
        if !intent.status.is_terminal() {
            intent.status = IntentStatus::Aborted;
            self.store.update_intent(&intent).await?;
            self.events.emit(PipelineEvent::IntentFinished {
                intent_id,
                status: IntentStatus::Aborted,
            });
        }
        Ok(())
    }

    /// Unfinished intents, for the status command.
    pub async fn unfinished(&self) -> PipelineResult<Vec<Intent>> {
        self.store.list_unfinished_intents().await
    }

    /// Assemble the run summary for an intent's current cycle:
    /// assertions, per-strategy attempt tallies, the ranked survivor
    /// table, and aggregated failure reasons.
    pub async fn report(&self, intent_id: Uuid) -> PipelineResult<PipelineReport> {
        let intent = self.load_intent(intent_id).await?;
        let spec = self.latest_spec(&intent).await?;

        let assertions = spec
            .assertions
            .iter()
            .map(|a| (a.description.clone(), a.weight))
            .collect();

        let attempts = self
            .store
            .list_attempts_for_spec(&spec.id, spec.version)
            .await?;
        let mut tallies: std::collections::BTreeMap<String, super::run_report::StrategyTally> =
            std::collections::BTreeMap::new();
        let mut failures = Vec::new();
        for attempt in &attempts {
            let tally = tallies
                .entry(attempt.strategy.as_str().to_string())
                .or_default();
            tally.generated += 1;
            match attempt.status {
                AttemptStatus::Passed => tally.passed += 1,
                AttemptStatus::Failed => {
                    tally.failed += 1;
                    if let Some(verification) = self
                        .store
                        .latest_verification_for_attempt(attempt.id)
                        .await?
                    {
                        if let Some(reason) = verification.first_failure {
                            failures.push(reason);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut survivors = self.current_survivors(&intent).await?;
        survivors.sort_by_key(|s| s.rank);
        let mut rows = Vec::with_capacity(survivors.len());
        for survivor in &survivors {
            let attempt = self
                .store
                .get_attempt(survivor.attempt_id)
                .await?
                .ok_or(PipelineError::AttemptNotFound(survivor.attempt_id))?;
            rows.push(SurvivorRow {
                rank: survivor.rank,
                strategy: attempt.strategy,
                overall: survivor.score.overall,
                changed_lines: attempt.changed_lines(),
                approach: attempt.approach,
            });
        }

        Ok(PipelineReport {
            intent_id,
            spec_version: spec.version,
            assertions,
            attempts: tallies,
            survivors: rows,
            failures: aggregate_reasons(failures, self.config.orchestrator.failure_report_reasons),
        })
    }

    // ------------------------------------------------------------------
    // Phase machine
    // ------------------------------------------------------------------

    async fn drive(&self, intent: &mut Intent) -> PipelineResult<RunOutcome> {
        let ledger = Arc::new(CostLedger::new(
            self.config.generation.cost_ceiling_usd,
            self.config.generation.estimated_call_cost_usd,
        ));
        let ctx = RunContext::new(ledger);
        self.active.write().await.insert(intent.id, ctx.clone());
        let result = self.advance(intent, &ctx).await;
        self.active.write().await.remove(&intent.id);
        result
    }

    async fn advance(&self, intent: &mut Intent, ctx: &RunContext) -> PipelineResult<RunOutcome> {
        loop {
            if ctx.is_canceled() && !intent.status.is_terminal() {
                return self.mark_aborted(intent).await;
            }

            self.events.emit(PipelineEvent::PhaseStarted {
                intent_id: intent.id,
                phase: intent.status,
            });

            match intent.status {
                IntentStatus::Parsing => {
                    if let Some(outcome) = self.run_parsing(intent, ctx).await? {
                        return Ok(outcome);
                    }
                }
                IntentStatus::Clarifying => {
                    let questions = intent
                        .parsed
                        .as_ref()
                        .map(|p| p.unclear.clone())
                        .unwrap_or_default();
                    return Ok(RunOutcome::Clarification {
                        intent_id: intent.id,
                        questions,
                    });
                }
                IntentStatus::Compiling => {
                    if let Some(outcome) = self.run_compiling(intent, ctx).await? {
                        return Ok(outcome);
                    }
                }
                IntentStatus::Generating => {
                    if let Some(outcome) = self.run_generating(intent, ctx).await? {
                        return Ok(outcome);
                    }
                }
                IntentStatus::Verifying => {
                    if let Some(outcome) = self.run_verifying(intent, ctx).await? {
                        return Ok(outcome);
                    }
                }
                IntentStatus::Ranking => {
                    if let Some(outcome) = self.run_ranking(intent, ctx).await? {
                        return Ok(outcome);
                    }
                }
                IntentStatus::Judging => return self.present(intent).await,
                IntentStatus::Complete | IntentStatus::Failed | IntentStatus::Aborted => {
                    return Err(PipelineError::Validation(format!(
                        "intent {} is already terminal ({})",
                        intent.id, intent.status
                    )));
                }
            }
        }
    }

    /// Parse the raw message. Returns an outcome when the pipeline must
    /// stop here (clarification or failure), None to continue.
    async fn run_parsing(
        &self,
        intent: &mut Intent,
        ctx: &RunContext,
    ) -> PipelineResult<Option<RunOutcome>> {
        let parsed = match self.compiler.parse(intent, ctx).await {
            Ok(parsed) => parsed,
            Err(err) => return self.fail(intent, IntentStatus::Parsing, err).await.map(Some),
        };

        let needs_clarification = parsed.needs_clarification();
        intent.parsed = Some(parsed.clone());

        if needs_clarification {
            self.transition(intent, IntentStatus::Clarifying).await?;
            self.events.emit(PipelineEvent::ClarificationNeeded {
                intent_id: intent.id,
                questions: parsed.unclear.clone(),
            });
            return Ok(Some(RunOutcome::Clarification {
                intent_id: intent.id,
                questions: parsed.unclear,
            }));
        }

        self.transition(intent, IntentStatus::Compiling).await?;
        Ok(None)
    }

    async fn run_compiling(
        &self,
        intent: &mut Intent,
        ctx: &RunContext,
    ) -> PipelineResult<Option<RunOutcome>> {
        let version = self
            .store
            .latest_spec_for_intent(intent.id)
            .await?
            .map(|s| s.version + 1)
            .unwrap_or(1);

        let spec = match self.compiler.compile(intent, version, ctx).await {
            Ok(spec) => spec,
            Err(err) => {
                return self
                    .fail(intent, IntentStatus::Compiling, err)
                    .await
                    .map(Some)
            }
        };

        self.store.save_spec(&spec).await?;
        info!(
            spec_id = %spec.id,
            version = spec.version,
            assertions = spec.assertions.len(),
            "specification compiled"
        );
        self.transition(intent, IntentStatus::Generating).await?;
        Ok(None)
    }

    async fn run_generating(
        &self,
        intent: &mut Intent,
        ctx: &RunContext,
    ) -> PipelineResult<Option<RunOutcome>> {
        let spec = self.latest_spec(intent).await?;
        let outcome = self.swarm.generate(&spec, ctx, &self.events).await;

        for attempt in &outcome.attempts {
            self.store.save_attempt(attempt).await?;
        }
        info!(
            attempts = outcome.attempts.len(),
            discarded = outcome.discarded,
            ceiling_hit = outcome.ceiling_hit,
            "generation phase finished"
        );

        self.transition(intent, IntentStatus::Verifying).await?;
        Ok(None)
    }

    async fn run_verifying(
        &self,
        intent: &mut Intent,
        ctx: &RunContext,
    ) -> PipelineResult<Option<RunOutcome>> {
        let spec = self.latest_spec(intent).await?;
        let attempts: Vec<Attempt> = self
            .store
            .list_attempts_for_spec(&spec.id, spec.version)
            .await?
            .into_iter()
            .filter(|a| {
                matches!(a.status, AttemptStatus::Pending | AttemptStatus::Verifying)
            })
            .collect();

        for attempt in &attempts {
            self.store
                .update_attempt_status(attempt.id, AttemptStatus::Verifying)
                .await?;
        }

        let results = self
            .harness
            .verify_batch(attempts, &spec, ctx, &self.events)
            .await;

        for (attempt_id, result) in results {
            match result {
                Ok(verification) => {
                    let status = if verification.passed {
                        AttemptStatus::Passed
                    } else {
                        AttemptStatus::Failed
                    };
                    self.store.save_verification(&verification).await?;
                    self.store.update_attempt_status(attempt_id, status).await?;
                }
                Err(PipelineError::Canceled) => {
                    // Left for the next resumption.
                    self.store
                        .update_attempt_status(attempt_id, AttemptStatus::Pending)
                        .await?;
                }
                Err(err) => {
                    error!(attempt_id = %attempt_id, error = %err, "verification errored");
                    self.store
                        .update_attempt_status(attempt_id, AttemptStatus::Failed)
                        .await?;
                }
            }
        }

        self.transition(intent, IntentStatus::Ranking).await?;
        Ok(None)
    }

    async fn run_ranking(
        &self,
        intent: &mut Intent,
        ctx: &RunContext,
    ) -> PipelineResult<Option<RunOutcome>> {
        let spec = self.latest_spec(intent).await?;
        let attempts = self
            .store
            .list_attempts_for_spec(&spec.id, spec.version)
            .await?;

        let mut candidates: Vec<(Attempt, Verification)> = Vec::new();
        for attempt in attempts {
            if attempt.status != AttemptStatus::Passed {
                continue;
            }
            if let Some(verification) = self
                .store
                .latest_verification_for_attempt(attempt.id)
                .await?
            {
                if verification.passed {
                    candidates.push((attempt, verification));
                }
            }
        }

        let survivors = self.ranking.rank(intent.id, candidates, ctx).await;
        for survivor in &survivors {
            self.store.save_survivor(survivor).await?;
        }
        self.events.emit(PipelineEvent::SurvivorsRanked {
            intent_id: intent.id,
            count: survivors.len(),
        });

        self.transition(intent, IntentStatus::Judging).await?;
        Ok(None)
    }

    /// Present the current cycle's survivors, or report no survivors.
    async fn present(&self, intent: &mut Intent) -> PipelineResult<RunOutcome> {
        let mut survivors = self.current_survivors(intent).await?;

        if survivors.is_empty() {
            let report = self.failure_report(intent).await?;
            self.events.emit(PipelineEvent::NoSurvivors {
                intent_id: intent.id,
                top_reasons: report.reasons.iter().map(|(r, _)| r.clone()).collect(),
            });
            return Ok(RunOutcome::NoSurvivors {
                intent_id: intent.id,
                report,
            });
        }

        for survivor in &mut survivors {
            self.store.mark_survivor_presented(survivor.id).await?;
            survivor.presented = true;
        }
        survivors.sort_by_key(|s| s.rank);

        Ok(RunOutcome::AwaitingJudgment {
            intent_id: intent.id,
            survivors,
        })
    }

    // ------------------------------------------------------------------
    // Judgment handlers
    // ------------------------------------------------------------------

    async fn accept(
        &self,
        intent: &mut Intent,
        judgment: Judgment,
    ) -> PipelineResult<JudgmentOutcome> {
        // Re-applying an accept on a completed intent is a refused no-op.
        if intent.status == IntentStatus::Complete {
            return Err(PipelineError::Validation(format!(
                "intent {} is already complete; refusing to re-apply",
                intent.id
            )));
        }
        if intent.status != IntentStatus::Judging {
            return Err(PipelineError::InvalidPhaseTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Complete.to_string(),
            });
        }

        let survivor_id = judgment
            .survivor_id
            .ok_or_else(|| PipelineError::Validation("accept requires a survivor id".into()))?;
        let survivor = self
            .store
            .get_survivor(survivor_id)
            .await?
            .ok_or(PipelineError::SurvivorNotFound(survivor_id))?;
        if survivor.intent_id != intent.id {
            return Err(PipelineError::Validation(
                "survivor belongs to a different intent".into(),
            ));
        }
        let attempt = self
            .store
            .get_attempt(survivor.attempt_id)
            .await?
            .ok_or(PipelineError::AttemptNotFound(survivor.attempt_id))?;

        self.store.save_judgment(&judgment).await?;
        self.applier.apply(&attempt.changes).await?;

        self.transition(intent, IntentStatus::Complete).await?;
        self.events.emit(PipelineEvent::IntentFinished {
            intent_id: intent.id,
            status: IntentStatus::Complete,
        });
        info!(intent_id = %intent.id, survivor_id = %survivor.id, "survivor applied");
        Ok(JudgmentOutcome::Applied {
            intent_id: intent.id,
        })
    }

    async fn refine(
        &self,
        intent: &mut Intent,
        judgment: Judgment,
    ) -> PipelineResult<JudgmentOutcome> {
        if intent.status != IntentStatus::Judging {
            return Err(PipelineError::InvalidPhaseTransition {
                from: intent.status.to_string(),
                to: IntentStatus::Compiling.to_string(),
            });
        }

        let text = judgment
            .refinement
            .clone()
            .ok_or_else(|| PipelineError::Validation("refine requires text".into()))?;
        self.store.save_judgment(&judgment).await?;

        intent.absorb_refinement(&text);
        if intent.refinement_count >= self.config.orchestrator.refinement_warning_threshold {
            warn!(
                intent_id = %intent.id,
                count = intent.refinement_count,
                "refinement loop running long"
            );
            self.events.emit(PipelineEvent::RefinementLoopWarning {
                intent_id: intent.id,
                count: intent.refinement_count,
            });
        }

        self.transition(intent, IntentStatus::Compiling).await?;
        let outcome = self.drive(intent).await?;
        Ok(JudgmentOutcome::Continued(outcome))
    }

    async fn redirect(
        &self,
        intent: &mut Intent,
        judgment: Judgment,
    ) -> PipelineResult<JudgmentOutcome> {
        let text = judgment
            .redirect
            .clone()
            .ok_or_else(|| PipelineError::Validation("redirect requires text".into()))?;
        self.store.save_judgment(&judgment).await?;
        self.abort_intent(intent.id).await?;

        let mut fresh = Intent::new(intent.session_id, text);
        self.store.save_intent(&fresh).await?;
        info!(old = %intent.id, new = %fresh.id, "redirected to fresh intent");

        let outcome = self.drive(&mut fresh).await?;
        Ok(JudgmentOutcome::Redirected {
            new_intent_id: fresh.id,
            outcome,
        })
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn load_intent(&self, id: Uuid) -> PipelineResult<Intent> {
        self.store
            .get_intent(id)
            .await?
            .ok_or(PipelineError::IntentNotFound(id))
    }

    async fn latest_spec(&self, intent: &Intent) -> PipelineResult<Specification> {
        self.store
            .latest_spec_for_intent(intent.id)
            .await?
            .ok_or_else(|| PipelineError::SpecNotFound(intent.id.to_string(), 0))
    }

    /// Survivors belonging to the latest specification version.
    async fn current_survivors(&self, intent: &Intent) -> PipelineResult<Vec<Survivor>> {
        let spec = self.latest_spec(intent).await?;
        let mut current = Vec::new();
        for survivor in self.store.list_survivors_for_intent(intent.id).await? {
            if let Some(attempt) = self.store.get_attempt(survivor.attempt_id).await? {
                if attempt.spec_id == spec.id && attempt.spec_version == spec.version {
                    current.push(survivor);
                }
            }
        }
        Ok(current)
    }

    /// Aggregate why the current cycle's attempts died.
    async fn failure_report(&self, intent: &Intent) -> PipelineResult<FailureReport> {
        let spec = self.latest_spec(intent).await?;
        let attempts = self
            .store
            .list_attempts_for_spec(&spec.id, spec.version)
            .await?;

        let mut failures = Vec::new();
        let mut total = 0usize;
        for attempt in &attempts {
            if attempt.status != AttemptStatus::Failed {
                continue;
            }
            total += 1;
            if let Some(verification) = self
                .store
                .latest_verification_for_attempt(attempt.id)
                .await?
            {
                if let Some(reason) = verification.first_failure {
                    failures.push(reason);
                }
            }
        }

        let reasons = aggregate_reasons(failures, self.config.orchestrator.failure_report_reasons);
        let suggestion = match reasons.first() {
            Some((dominant, count)) => format!(
                "{count} of {total} attempts failed first at \"{dominant}\"; \
                 consider refining the request to constrain that area."
            ),
            None => {
                "No attempt was generated at all; consider rephrasing the request \
                 or raising the cost ceiling."
                    .to_string()
            }
        };

        Ok(FailureReport {
            phase: IntentStatus::Verifying,
            reasons,
            suggestion,
        })
    }

    async fn transition(&self, intent: &mut Intent, next: IntentStatus) -> PipelineResult<()> {
        if !intent.status.can_transition_to(next) {
            return Err(PipelineError::InvalidPhaseTransition {
                from: intent.status.to_string(),
                to: next.to_string(),
            });
        }
        self.events.emit(PipelineEvent::PhaseCompleted {
            intent_id: intent.id,
            phase: intent.status,
        });
        intent.status = next;
        self.store.update_intent(intent).await
    }

    async fn mark_aborted(&self, intent: &mut Intent) -> PipelineResult<RunOutcome> {
        intent.status = IntentStatus::Aborted;
        self.store.update_intent(intent).await?;
        self.events.emit(PipelineEvent::IntentFinished {
            intent_id: intent.id,
            status: IntentStatus::Aborted,
        });
        Ok(RunOutcome::Aborted {
            intent_id: intent.id,
        })
    }

    /// Terminal failure for the intent; the outcome names the phase and
    /// condition for the final report.
    async fn fail(
        &self,
        intent: &mut Intent,
        phase: IntentStatus,
        err: PipelineError,
    ) -> PipelineResult<RunOutcome> {
        if matches!(err, PipelineError::Canceled) {
            return self.mark_aborted(intent).await;
        }

        error!(intent_id = %intent.id, phase = %phase, error = %err, "pipeline failed");
        intent.status = IntentStatus::Failed;
        self.store.update_intent(intent).await?;
        self.events.emit(PipelineEvent::IntentFinished {
            intent_id: intent.id,
            status: IntentStatus::Failed,
        });
        Ok(RunOutcome::Failed {
            intent_id: intent.id,
            phase,
            reason: err.to_string(),
        })
    }
}

/// Count identical failure reasons and keep the most common.
fn aggregate_reasons(failures: Vec<String>, top: usize) -> Vec<(String, usize)> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for failure in failures {
        *counts.entry(failure).or_default() += 1;
    }
    let mut reasons: Vec<(String, usize)> = counts.into_iter().collect();
    reasons.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    reasons.truncate(top);
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_reasons_orders_by_count_then_name() {
        let reasons = aggregate_reasons(
            vec![
                "lint: unused".into(),
                "typecheck: bad type".into(),
                "lint: unused".into(),
                "spec_tests: assertion".into(),
                "lint: unused".into(),
                "typecheck: bad type".into(),
            ],
            2,
        );
        assert_eq!(
            reasons,
            vec![("lint: unused".to_string(), 3), ("typecheck: bad type".to_string(), 2)]
        );
    }

    #[test]
    fn aggregate_reasons_empty_input() {
        assert!(aggregate_reasons(vec![], 3).is_empty());
    }

    #[test]
    fn failure_report_renders_counts_and_suggestion() {
        let report = FailureReport {
            phase: IntentStatus::Verifying,
            reasons: vec![("typecheck: identifier X".into(), 3)],
            suggestion: "consider constraining X to type Y".into(),
        };
        let rendered = report.render();
        assert!(rendered.contains("3 attempt(s)"));
        assert!(rendered.contains("identifier X"));
        assert!(rendered.contains("consider constraining"));
    }
}
