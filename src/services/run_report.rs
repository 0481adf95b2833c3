//! Run summary rendering.
//!
//! The human-facing summary of one pipeline cycle: the specification's
//! assertions, how each strategy's attempts fared, the ranked survivor
//! table, and aggregated failure summaries. Rendered after ranking on
//! both the survivors and the no-survivors paths.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::domain::models::Strategy;

/// How one strategy's attempts fared in a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyTally {
    pub generated: usize,
    pub passed: usize,
    pub failed: usize,
}

/// One line of the survivor table.
#[derive(Debug, Clone)]
pub struct SurvivorRow {
    pub rank: u32,
    pub strategy: Strategy,
    pub overall: f64,
    pub changed_lines: usize,
    pub approach: String,
}

/// Complete summary of one pipeline cycle.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub intent_id: Uuid,
    pub spec_version: u32,
    /// Assertion descriptions with their weights, in spec order.
    pub assertions: Vec<(String, u8)>,
    /// Per-strategy tallies, keyed by strategy name for stable order.
    pub attempts: BTreeMap<String, StrategyTally>,
    /// Survivor table in rank order; empty on the no-survivors path.
    pub survivors: Vec<SurvivorRow>,
    /// Aggregated failure reasons with how many attempts hit each.
    pub failures: Vec<(String, usize)>,
}

impl PipelineReport {
    pub fn render(&self) -> String {
        let mut s = String::new();
        s.push_str(&format!("Run summary (spec v{})\n", self.spec_version));
        s.push_str("===========\n\n");

        s.push_str(&format!("Assertions: {}\n", self.assertions.len()));
        for (description, weight) in &self.assertions {
            s.push_str(&format!("  - [{weight}] {description}\n"));
        }

        s.push_str("\nAttempts:\n");
        for (strategy, tally) in &self.attempts {
            s.push_str(&format!(
                "  {strategy}: {} generated, {} passed, {} failed\n",
                tally.generated, tally.passed, tally.failed,
            ));
        }

        if self.survivors.is_empty() {
            s.push_str("\nResult: NO SURVIVORS\n");
        } else {
            s.push_str(&format!("\nSurvivors: {}\n", self.survivors.len()));
            for row in &self.survivors {
                s.push_str(&format!(
                    "  #{} [{}] score {:.3}  {} lines  {}\n",
                    row.rank, row.strategy, row.overall, row.changed_lines, row.approach,
                ));
            }
        }

        if !self.failures.is_empty() {
            s.push_str("\nFailures:\n");
            for (reason, count) in &self.failures {
                s.push_str(&format!("  {count} attempt(s): {reason}\n"));
            }
        }

        s
    }
}
