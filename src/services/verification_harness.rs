//! Verification harness: apply an attempt to an isolated workspace and
//! run the staged checks against it.
//!
//! Stages run in order (typecheck, lint, unit tests, spec tests) and
//! short-circuit on the first hard failure; unrun stages are recorded as
//! skipped. Unit and spec stages may be flaky and are re-run up to the
//! configured count, passing when passes strictly exceed half the runs.
//! Exclusion of the spec-suite path from the unit-test run is the unit
//! command's concern; the harness only places the suite at the reserved
//! path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{
    Attempt, CheckResult, CheckStage, EventSender, PipelineEvent, Specification,
    VerificationConfig, Verification,
};
use crate::infrastructure::process::SubprocessRunner;
use crate::infrastructure::workspace::WorkspaceManager;

use super::run_context::RunContext;

/// How many extracted error lines a check result keeps.
const MAX_EXTRACTED_ERRORS: usize = 10;

pub struct VerificationHarness {
    workspaces: Arc<WorkspaceManager>,
    runner: SubprocessRunner,
    config: VerificationConfig,
}

impl VerificationHarness {
    pub fn new(workspaces: Arc<WorkspaceManager>, config: VerificationConfig) -> Self {
        // Checkers are opaque; the network and dependency policies reach
        // them through the environment.
        let runner = SubprocessRunner::new(config.stream_cap_bytes)
            .with_env(
                "MANIFEST_ALLOW_NETWORK",
                if config.allow_network_in_tests { "1" } else { "0" },
            )
            .with_env(
                "MANIFEST_AUTO_INSTALL",
                if config.auto_install_dependencies { "1" } else { "0" },
            );
        Self {
            workspaces,
            runner,
            config,
        }
    }

    /// Verify one attempt in its own workspace.
    #[instrument(skip(self, attempt, spec, ctx), fields(attempt_id = %attempt.id))]
    pub async fn verify(
        &self,
        attempt: &Attempt,
        spec: &Specification,
        ctx: &RunContext,
    ) -> PipelineResult<Verification> {
        let started = Instant::now();
        let assertions_total = spec.assertions.len() as u32;
        let suite_path = self.config.spec_suite_path.clone();
        let suite_text = spec.test_suite.clone();

        let (checks, assertions_passed) = self
            .workspaces
            .with_workspace(
                attempt.id,
                &attempt.changes,
                Some((suite_path.as_str(), suite_text.as_str())),
                |workspace| async move {
                    let mut checks: Vec<CheckResult> = Vec::with_capacity(4);
                    let mut assertions_passed = 0u32;
                    let mut short_circuited = false;

                    for stage in CheckStage::ordered() {
                        if short_circuited {
                            checks.push(CheckResult::skipped(stage));
                            continue;
                        }

                        let result = self.run_stage(stage, &workspace, ctx).await;
                        if stage == CheckStage::SpecTests && !result.passed {
                            assertions_passed =
                                parse_passed_count(&result.output).min(assertions_total);
                        }
                        if !result.passed {
                            short_circuited = true;
                        }
                        checks.push(result);
                    }

                    Ok((checks, assertions_passed))
                },
            )
            .await?;

        let verification = Verification::from_checks(
            attempt.id,
            checks,
            assertions_passed,
            assertions_total,
            started.elapsed().as_millis() as u64,
        );

        info!(
            passed = verification.passed,
            first_failure = verification.first_failure.as_deref().unwrap_or(""),
            "verification finished"
        );
        Ok(verification)
    }

    /// Verify many attempts concurrently, capped by the harness pool.
    ///
    /// Attempt failures stay isolated. A workspace-capacity failure stops
    /// new submissions (verification pauses) while started ones drain;
    /// the error is surfaced in that attempt's slot for the orchestrator.
    pub async fn verify_batch(
        self: &Arc<Self>,
        attempts: Vec<Attempt>,
        spec: &Specification,
        ctx: &RunContext,
        events: &EventSender,
    ) -> Vec<(Uuid, PipelineResult<Verification>)> {
        let pool = Arc::new(Semaphore::new(self.config.harness_concurrency));
        let paused = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for attempt in attempts {
            let harness = Arc::clone(self);
            let pool = pool.clone();
            let paused = paused.clone();
            let spec = spec.clone();
            let ctx = ctx.clone();
            let events = events.clone();

            tasks.spawn(async move {
                let _permit = match pool.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (attempt.id, Err(PipelineError::Canceled)),
                };
                if paused.load(Ordering::SeqCst) || ctx.is_canceled() {
                    return (attempt.id, Err(PipelineError::Canceled));
                }

                let result = harness.verify(&attempt, &spec, &ctx).await;
                match &result {
                    Ok(verification) => {
                        events.emit(PipelineEvent::VerificationFinished {
                            attempt_id: attempt.id,
                            passed: verification.passed,
                            first_failure: verification.first_failure.clone(),
                        });
                    }
                    Err(PipelineError::DiskFull(detail)) => {
                        warn!(detail = %detail, "workspace capacity exhausted; pausing verification");
                        paused.store(true, Ordering::SeqCst);
                    }
                    Err(err) => {
                        warn!(attempt_id = %attempt.id, error = %err, "verification errored");
                    }
                }
                (attempt.id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => warn!(error = %e, "verification task panicked"),
            }
        }
        results
    }

    /// Run one stage, with flaky re-runs for the test stages.
    async fn run_stage(
        &self,
        stage: CheckStage,
        cwd: &std::path::Path,
        ctx: &RunContext,
    ) -> CheckResult {
        let command = self.config.command_for(stage);
        let deadline = Duration::from_secs(command.deadline_secs);
        let started = Instant::now();

        let total_runs = if stage.is_retryable() {
            1 + self.config.flaky_retries
        } else {
            1
        };

        let mut passes = 0u32;
        let mut runs = 0u32;
        let mut last = None;
        for _ in 0..total_runs {
            let output = self.runner.run(&command.argv, cwd, deadline, &ctx.cancel).await;
            runs += 1;
            if output.success() {
                passes += 1;
            }
            let passed_first_try = runs == 1 && output.success();
            last = Some(output);
            if passed_first_try || ctx.is_canceled() {
                break;
            }
        }

        let output = last.unwrap_or_else(|| crate::infrastructure::process::CommandOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: "stage never ran".into(),
            timed_out: false,
        });

        let passed = passes * 2 > runs;
        let mut combined = output.stdout.clone();
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&output.stderr);
        }
        let mut errors = extract_errors(&combined);
        if output.timed_out {
            errors.insert(0, format!("{stage} exceeded its {}s deadline", command.deadline_secs));
        }

        CheckResult {
            stage,
            passed,
            exit_code: output.exit_code,
            output: combined,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
            skipped: false,
        }
    }
}

/// Pull error lines out of checker output.
fn extract_errors(output: &str) -> Vec<String> {
    let mut errors = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("error") || trimmed.contains(": error ") {
            errors.push(trimmed.to_string());
            if errors.len() == MAX_EXTRACTED_ERRORS {
                break;
            }
        }
    }
    errors
}

/// Parse the number of passing tests from structured runner output.
///
/// Recognizes the Rust summary line `test result: ok. N passed; ...`
/// and falls back to counting `test ... ok` lines; zero when neither
/// shape is present.
fn parse_passed_count(output: &str) -> u32 {
    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("test result:") {
            for part in trimmed.split(';') {
                if part.contains("passed") {
                    for word in part.split_whitespace() {
                        if let Ok(n) = word.parse::<u32>() {
                            return n;
                        }
                    }
                }
            }
        }
    }

    output
        .lines()
        .filter(|line| {
            let t = line.trim();
            t.starts_with("test ") && t.ends_with("... ok")
        })
        .count() as u32
}
