//! Service layer: the pipeline phases and the orchestrator that drives
//! them.

pub mod change_applier;
pub mod codebase;
pub mod generation_swarm;
pub mod intent_compiler;
pub mod orchestrator;
pub mod prompts;
pub mod ranking;
pub mod run_context;
pub mod run_report;
pub mod verification_harness;

pub use change_applier::ChangeApplier;
pub use codebase::{CodebaseScanner, ProjectSnapshot, ScanFilters};
pub use generation_swarm::{GenerationSwarm, SwarmOutcome};
pub use intent_compiler::IntentCompiler;
pub use orchestrator::{FailureReport, JudgmentOutcome, Orchestrator, RunOutcome};
pub use ranking::RankingEngine;
pub use run_context::RunContext;
pub use run_report::PipelineReport;
pub use verification_harness::VerificationHarness;
