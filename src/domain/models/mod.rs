//! Domain models for the Manifest pipeline.

pub mod attempt;
pub mod config;
pub mod event;
pub mod intent;
pub mod judgment;
pub mod spec;
pub mod survivor;
pub mod verification;

pub use attempt::{Attempt, AttemptStatus, FileAction, FileChange, Strategy};
pub use config::{
    AiConfig, DatabaseConfig, GenerationConfig, LoggingConfig, ManifestConfig,
    OrchestratorConfig, RankingConfig, StageCommand, VerificationConfig, WorkspaceConfig,
};
pub use event::{EventSender, PipelineEvent};
pub use intent::{Intent, IntentStatus, ParsedIntent};
pub use judgment::{Decision, Judgment};
pub use spec::{stable_spec_id, Assertion, SpecValidationError, Specification};
pub use survivor::{ScoreCard, Survivor};
pub use verification::{CheckResult, CheckStage, Verification};
