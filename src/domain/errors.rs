//! Error taxonomy for the Manifest pipeline.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::CheckStage;

/// Errors that can occur anywhere in the pipeline.
///
/// Errors from a single attempt are isolated and never fail siblings;
/// phase-wide errors (store, gateway exhaustion) surface to the
/// orchestrator, which decides whether to retry, degrade, or terminate.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Intent message is empty")]
    EmptyMessage,

    #[error("AI backend unavailable: {0}")]
    AiUnavailable(String),

    #[error("AI backend transient failure: {0}")]
    AiTransient(String),

    #[error("Malformed AI response: {0}")]
    MalformedAiResponse(String),

    #[error("Cost ceiling reached: spent ${spent_usd:.4} of ${ceiling_usd:.4}")]
    CostCeilingReached { spent_usd: f64, ceiling_usd: f64 },

    #[error("Specification has no testable conditions")]
    NoTestableConditions,

    #[error("Contradictory constraints: {0}")]
    ContradictoryConstraints(String),

    #[error("Codebase unreadable: {0}")]
    CodebaseUnreadable(String),

    #[error("Workspace creation failed: {0}")]
    WorkspaceCreationFailed(String),

    #[error("Disk full or workspace capacity exhausted: {0}")]
    DiskFull(String),

    #[error("Stage {stage} exceeded its deadline")]
    StageTimeout { stage: CheckStage },

    #[error("Stage {stage} crashed: {detail}")]
    StageCrashed { stage: CheckStage, detail: String },

    #[error("Storage contention persisted past the retry budget: {0}")]
    StorageContention(String),

    #[error("Storage corruption detected: {0}")]
    StorageCorruption(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Intent not found: {0}")]
    IntentNotFound(Uuid),

    #[error("Specification not found: {0} v{1}")]
    SpecNotFound(String, u32),

    #[error("Attempt not found: {0}")]
    AttemptNotFound(Uuid),

    #[error("Survivor not found: {0}")]
    SurvivorNotFound(Uuid),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Run canceled")]
    Canceled,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}
