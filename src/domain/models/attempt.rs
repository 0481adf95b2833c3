//! Attempt domain model.
//!
//! An Attempt is one candidate implementation: an ordered list of file
//! changes produced by a single generation call under one strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::spec::Specification;

/// Generation strategy for an attempt. Strategy semantics live in the
/// implementation prompt, not in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Straightforward implementation.
    Vanilla,
    /// Fewest lines that satisfy the spec.
    Minimal,
    /// Maximum input validation and error handling.
    Defensive,
    /// Match the existing codebase style closely.
    Patterned,
    /// Variation of a completed sibling attempt in the same batch.
    Mutation,
    /// Literal satisfaction of the tests, nothing more.
    Adversarial,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vanilla => "vanilla",
            Self::Minimal => "minimal",
            Self::Defensive => "defensive",
            Self::Patterned => "patterned",
            Self::Mutation => "mutation",
            Self::Adversarial => "adversarial",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "vanilla" => Some(Self::Vanilla),
            "minimal" => Some(Self::Minimal),
            "defensive" => Some(Self::Defensive),
            "patterned" => Some(Self::Patterned),
            "mutation" => Some(Self::Mutation),
            "adversarial" => Some(Self::Adversarial),
            _ => None,
        }
    }

}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a file change does to its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// One file-level change within an attempt.
///
/// `content` is present exactly when the action is not a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub content: Option<String>,
}

impl FileChange {
    /// Check the content/action pairing invariant.
    pub fn validate(&self) -> Result<(), String> {
        match (self.action, self.content.is_some()) {
            (FileAction::Delete, true) => {
                Err(format!("delete of '{}' must not carry content", self.path))
            }
            (FileAction::Create | FileAction::Modify, false) => {
                Err(format!("{} of '{}' requires content", self.action.as_str(), self.path))
            }
            _ => Ok(()),
        }
    }

    /// Number of lines this change introduces.
    pub fn line_count(&self) -> usize {
        self.content.as_deref().map_or(0, |c| c.lines().count())
    }
}

/// Lifecycle of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Verifying,
    Passed,
    Failed,
    /// Invalid paths, malformed response, or duplicate content.
    Discarded,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "verifying" => Some(Self::Verifying),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

/// One candidate implementation for one specification version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub spec_id: String,
    pub spec_version: u32,
    pub strategy: Strategy,
    pub changes: Vec<FileChange>,
    /// Short self-description of the approach taken.
    pub approach: String,
    /// Self-reported confidence in [0, 1].
    pub confidence: f64,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    pub fn new(
        spec_id: impl Into<String>,
        spec_version: u32,
        strategy: Strategy,
        changes: Vec<FileChange>,
        approach: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec_id: spec_id.into(),
            spec_version,
            strategy,
            changes,
            approach: approach.into(),
            confidence: confidence.clamp(0.0, 1.0),
            status: AttemptStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Content hash for batch-level dedup. Order-insensitive over paths,
    /// sensitive to action and content.
    pub fn content_hash(&self) -> String {
        let mut entries: Vec<String> = self
            .changes
            .iter()
            .map(|c| {
                format!(
                    "{}\x00{}\x00{}",
                    c.path,
                    c.action.as_str(),
                    c.content.as_deref().unwrap_or("")
                )
            })
            .collect();
        entries.sort();

        let mut hasher = Sha256::new();
        for entry in entries {
            hasher.update(entry.as_bytes());
            hasher.update([0u8]);
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Validate every change against the owning spec's path sets and the
    /// content/action pairing rules.
    pub fn validate_against(&self, spec: &Specification) -> Result<(), String> {
        if self.changes.is_empty() {
            return Err("attempt contains no file changes".into());
        }
        for change in &self.changes {
            change.validate()?;
            if !spec.allows_path(&change.path) {
                return Err(format!("path '{}' is outside the allowed set", change.path));
            }
        }
        Ok(())
    }

    /// Total lines across all non-delete changes.
    pub fn changed_lines(&self) -> usize {
        self.changes.iter().map(FileChange::line_count).sum()
    }

    /// Maximum brace-nesting depth across all change contents.
    pub fn max_nesting_depth(&self) -> usize {
        let mut max = 0usize;
        for change in &self.changes {
            let Some(content) = change.content.as_deref() else {
                continue;
            };
            let mut depth = 0usize;
            for ch in content.chars() {
                match ch {
                    '{' => {
                        depth += 1;
                        max = max.max(depth);
                    }
                    '}' => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
        }
        max
    }
}
