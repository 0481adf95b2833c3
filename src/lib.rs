//! Manifest - intent-to-code pipeline.
//!
//! Compiles a natural-language feature request into an executable
//! specification, generates candidate implementations in parallel,
//! verifies each in an isolated workspace, ranks the survivors, and
//! presents them for human judgment.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{PipelineError, PipelineResult};
pub use infrastructure::{ConfigError, ConfigLoader};
