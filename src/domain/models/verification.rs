//! Verification domain model.
//!
//! A Verification is the stage-by-stage reality check of one Attempt in
//! an isolated workspace: typecheck, lint, unit tests, spec tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four verification stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStage {
    Typecheck,
    Lint,
    UnitTests,
    SpecTests,
}

impl CheckStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typecheck => "typecheck",
            Self::Lint => "lint",
            Self::UnitTests => "unit_tests",
            Self::SpecTests => "spec_tests",
        }
    }

    /// All stages in execution order.
    pub fn ordered() -> [CheckStage; 4] {
        [Self::Typecheck, Self::Lint, Self::UnitTests, Self::SpecTests]
    }

    /// Whether failed runs of this stage may be flaky and worth re-running.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UnitTests | Self::SpecTests)
    }
}

impl std::fmt::Display for CheckStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one verification stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub stage: CheckStage,
    pub passed: bool,
    /// None when the checker failed to spawn.
    pub exit_code: Option<i32>,
    /// Captured stdout+stderr, truncated to the stream cap.
    pub output: String,
    /// Extracted error lines, when the output was parseable.
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// True when an earlier hard failure short-circuited this stage.
    pub skipped: bool,
}

impl CheckResult {
    pub fn skipped(stage: CheckStage) -> Self {
        Self {
            stage,
            passed: false,
            exit_code: None,
            output: String::new(),
            errors: vec![],
            duration_ms: 0,
            skipped: true,
        }
    }
}

/// The complete result of verifying one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    pub id: Uuid,
    pub attempt_id: Uuid,
    /// AND over every stage's `passed`.
    pub passed: bool,
    pub checks: Vec<CheckResult>,
    pub assertions_passed: u32,
    pub assertions_total: u32,
    pub duration_ms: u64,
    /// One-line summary of the first failing stage, when any failed.
    pub first_failure: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Verification {
    /// Assemble a verification from its stage results, computing the
    /// overall flag, the assertion counts, and the first-failure summary.
    pub fn from_checks(
        attempt_id: Uuid,
        checks: Vec<CheckResult>,
        assertions_passed: u32,
        assertions_total: u32,
        duration_ms: u64,
    ) -> Self {
        let passed = !checks.is_empty() && checks.iter().all(|c| c.passed);
        let assertions_passed = if passed {
            assertions_total
        } else {
            assertions_passed.min(assertions_total)
        };
        let first_failure = checks.iter().find(|c| !c.passed).map(Self::summarize);

        Self {
            id: Uuid::new_v4(),
            attempt_id,
            passed,
            checks,
            assertions_passed,
            assertions_total,
            duration_ms,
            first_failure,
            created_at: Utc::now(),
        }
    }

    /// One line describing why a stage failed: the most informative
    /// extracted error when present, otherwise the exit condition.
    fn summarize(check: &CheckResult) -> String {
        if check.skipped {
            return format!("{}: skipped after earlier failure", check.stage);
        }
        if let Some(first) = check.errors.first() {
            return format!("{}: {}", check.stage, first);
        }
        match check.exit_code {
            Some(code) => format!("{}: exited with status {}", check.stage, code),
            None => format!("{}: checker failed to start", check.stage),
        }
    }

    pub fn check(&self, stage: CheckStage) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(stage: CheckStage) -> CheckResult {
        CheckResult {
            stage,
            passed: true,
            exit_code: Some(0),
            output: String::new(),
            errors: vec![],
            duration_ms: 10,
            skipped: false,
        }
    }

    fn failed(stage: CheckStage, errors: Vec<String>) -> CheckResult {
        CheckResult {
            stage,
            passed: false,
            exit_code: Some(1),
            output: String::new(),
            errors,
            duration_ms: 10,
            skipped: false,
        }
    }

    #[test]
    fn passed_is_and_over_stages() {
        let v = Verification::from_checks(
            Uuid::new_v4(),
            CheckStage::ordered().map(ok).to_vec(),
            0,
            3,
            40,
        );
        assert!(v.passed);
        assert!(v.first_failure.is_none());
    }

    #[test]
    fn passed_implies_all_assertions() {
        let v = Verification::from_checks(
            Uuid::new_v4(),
            CheckStage::ordered().map(ok).to_vec(),
            1,
            3,
            40,
        );
        assert_eq!(v.assertions_passed, v.assertions_total);
    }

    #[test]
    fn first_failure_respects_stage_order() {
        let checks = vec![
            ok(CheckStage::Typecheck),
            failed(CheckStage::Lint, vec!["unused variable `x`".into()]),
            CheckResult::skipped(CheckStage::UnitTests),
            CheckResult::skipped(CheckStage::SpecTests),
        ];
        let v = Verification::from_checks(Uuid::new_v4(), checks, 0, 3, 40);
        assert!(!v.passed);
        assert_eq!(v.first_failure.as_deref(), Some("lint: unused variable `x`"));
    }

    #[test]
    fn assertions_passed_capped_at_total() {
        let v = Verification::from_checks(
            Uuid::new_v4(),
            vec![failed(CheckStage::SpecTests, vec![])],
            9,
            3,
            40,
        );
        assert_eq!(v.assertions_passed, 3);
    }

    #[test]
    fn spawn_failure_summary_is_distinct() {
        let crashed = CheckResult {
            stage: CheckStage::Typecheck,
            passed: false,
            exit_code: None,
            output: String::new(),
            errors: vec![],
            duration_ms: 0,
            skipped: false,
        };
        let v = Verification::from_checks(Uuid::new_v4(), vec![crashed], 0, 1, 5);
        assert_eq!(
            v.first_failure.as_deref(),
            Some("typecheck: checker failed to start")
        );
    }

    #[test]
    fn empty_checks_never_pass() {
        let v = Verification::from_checks(Uuid::new_v4(), vec![], 0, 1, 0);
        assert!(!v.passed);
    }
}
