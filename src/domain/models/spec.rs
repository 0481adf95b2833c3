//! Specification domain model.
//!
//! A Specification is the executable, testable definition of "done"
//! compiled from an Intent. Invariants (`may_touch` disjoint from
//! `must_not_touch`, every assertion carrying a non-empty test) are
//! enforced at construction, not downstream.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// A single testable success criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub id: Uuid,
    pub description: String,
    /// Executable test text for this criterion.
    pub test: String,
    /// Relative importance, 1..=10.
    pub weight: u8,
}

impl Assertion {
    pub fn new(description: impl Into<String>, test: impl Into<String>, weight: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            test: test.into(),
            weight: weight.clamp(1, 10),
        }
    }
}

/// Construction failures for a specification.
#[derive(Debug, Error, PartialEq)]
pub enum SpecValidationError {
    #[error("Specification has no assertions")]
    EmptyAssertions,

    #[error("Assertion '{0}' has an empty test")]
    EmptyAssertionTest(String),

    #[error("Path '{0}' appears in both may_touch and must_not_touch")]
    OverlappingPaths(String),
}

/// The executable specification for one intent, versioned on refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    /// Stable content-derived id; identical inputs yield identical ids.
    pub id: String,
    pub intent_id: Uuid,
    /// Strictly increases on refinement.
    pub version: u32,
    pub assertions: Vec<Assertion>,
    /// Complete runnable test-suite text covering every assertion.
    pub test_suite: String,
    pub type_contract: String,
    /// Paths an attempt is allowed to touch.
    pub may_touch: BTreeSet<String>,
    /// Paths an attempt must never touch. Disjoint from `may_touch`.
    pub must_not_touch: BTreeSet<String>,
    /// Codebase conventions generation prompts should follow.
    pub patterns: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Specification {
    /// Build a specification, enforcing invariants at the boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        intent_id: Uuid,
        version: u32,
        assertions: Vec<Assertion>,
        test_suite: String,
        type_contract: String,
        may_touch: BTreeSet<String>,
        must_not_touch: BTreeSet<String>,
        patterns: Vec<String>,
    ) -> Result<Self, SpecValidationError> {
        if assertions.is_empty() {
            return Err(SpecValidationError::EmptyAssertions);
        }
        for assertion in &assertions {
            if assertion.test.trim().is_empty() {
                return Err(SpecValidationError::EmptyAssertionTest(
                    assertion.description.clone(),
                ));
            }
        }
        if let Some(overlap) = may_touch.intersection(&must_not_touch).next() {
            return Err(SpecValidationError::OverlappingPaths(overlap.clone()));
        }

        Ok(Self {
            id,
            intent_id,
            version,
            assertions,
            test_suite,
            type_contract,
            may_touch,
            must_not_touch,
            patterns,
            created_at: Utc::now(),
        })
    }

    /// Whether an attempt may write to `path`.
    ///
    /// A path is allowed when it (or an ancestor) is listed in `may_touch`
    /// and neither it nor an ancestor is listed in `must_not_touch`.
    pub fn allows_path(&self, path: &str) -> bool {
        !Self::covered_by(path, &self.must_not_touch) && Self::covered_by(path, &self.may_touch)
    }

    fn covered_by(path: &str, set: &BTreeSet<String>) -> bool {
        let normalized = path.trim_start_matches("./");
        set.iter().any(|entry| {
            let entry = entry.trim_start_matches("./").trim_end_matches('/');
            normalized == entry || normalized.starts_with(&format!("{entry}/"))
        })
    }

}

/// Derive the stable specification id from its semantic inputs.
///
/// Identical (normalized intent, relevant-file set, assertion texts)
/// produce an identical id, independent of run timing.
pub fn stable_spec_id(
    normalized_intent: &str,
    relevant_files: &BTreeSet<String>,
    assertion_tests: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_intent.trim().to_lowercase().as_bytes());
    hasher.update([0u8]);
    for file in relevant_files {
        hasher.update(file.as_bytes());
        hasher.update([0u8]);
    }
    for test in assertion_tests {
        hasher.update(test.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
