//! Intent domain model.
//!
//! An Intent is one pipeline run: the raw human request, its parsed form,
//! and the phase it is currently in. Exactly one Intent exists per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of an intent in the pipeline state machine.
///
/// Phases progress monotonically except on explicit restart (refine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    /// Raw message is being parsed into structured form.
    Parsing,
    /// Parse produced open questions; waiting on the human.
    Clarifying,
    /// Codebase analysis and spec generation are running.
    Compiling,
    /// The generation swarm is producing attempts.
    Generating,
    /// Attempts are being verified in isolated workspaces.
    Verifying,
    /// Survivors are being scored and ordered.
    Ranking,
    /// Top survivors are presented; waiting on a judgment.
    Judging,
    /// A survivor was accepted and applied.
    Complete,
    /// The pipeline failed with a terminal condition.
    Failed,
    /// The human (or a redirect) aborted the run.
    Aborted,
}

impl Default for IntentStatus {
    fn default() -> Self {
        Self::Parsing
    }
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsing => "parsing",
            Self::Clarifying => "clarifying",
            Self::Compiling => "compiling",
            Self::Generating => "generating",
            Self::Verifying => "verifying",
            Self::Ranking => "ranking",
            Self::Judging => "judging",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "parsing" => Some(Self::Parsing),
            "clarifying" => Some(Self::Clarifying),
            "compiling" => Some(Self::Compiling),
            "generating" => Some(Self::Generating),
            "verifying" => Some(Self::Verifying),
            "ranking" => Some(Self::Ranking),
            "judging" => Some(Self::Judging),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }

    /// Valid transitions from this phase.
    ///
    /// `Judging -> Compiling` is the refine restart; `Clarifying -> Parsing`
    /// re-enters parsing once the human answers.
    pub fn valid_transitions(&self) -> Vec<IntentStatus> {
        match self {
            Self::Parsing => vec![Self::Clarifying, Self::Compiling, Self::Failed, Self::Aborted],
            Self::Clarifying => vec![Self::Parsing, Self::Aborted],
            Self::Compiling => vec![Self::Generating, Self::Failed, Self::Aborted],
            Self::Generating => vec![Self::Verifying, Self::Failed, Self::Aborted],
            Self::Verifying => vec![Self::Ranking, Self::Failed, Self::Aborted],
            Self::Ranking => vec![Self::Judging, Self::Failed, Self::Aborted],
            Self::Judging => vec![Self::Complete, Self::Compiling, Self::Failed, Self::Aborted],
            Self::Complete | Self::Failed | Self::Aborted => vec![],
        }
    }

    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The structured form of a raw feature request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    /// One-sentence statement of what the human wants.
    pub core: String,
    /// Hard requirements.
    #[serde(default)]
    pub must: Vec<String>,
    /// Hard prohibitions.
    #[serde(default)]
    pub must_not: Vec<String>,
    /// Observable completion conditions; each becomes an assertion.
    #[serde(default)]
    pub done_when: Vec<String>,
    /// Open questions the human must answer before compilation.
    #[serde(default)]
    pub unclear: Vec<String>,
    /// Optional free-form scope note.
    #[serde(default)]
    pub scope: Option<String>,
}

impl ParsedIntent {
    pub fn needs_clarification(&self) -> bool {
        !self.unclear.is_empty()
    }
}

/// One pipeline run from raw message to judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Original message, plus appended refinement text on refine.
    pub raw_message: String,
    pub parsed: Option<ParsedIntent>,
    pub status: IntentStatus,
    /// How many refine judgments this intent has absorbed.
    pub refinement_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    pub fn new(session_id: Uuid, raw_message: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            raw_message: raw_message.into(),
            parsed: None,
            status: IntentStatus::Parsing,
            refinement_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append refinement text for a new compile cycle.
    pub fn absorb_refinement(&mut self, text: &str) {
        self.raw_message.push_str("\n\nRefinement: ");
        self.raw_message.push_str(text);
        self.refinement_count += 1;
        self.updated_at = Utc::now();
    }
}
