//! Infrastructure adapters: persistence, AI gateway, workspaces,
//! subprocesses, configuration, and logging.

pub mod ai;
pub mod config;
pub mod logging;
pub mod process;
pub mod sqlite;
pub mod workspace;

pub use ai::{AiGateway, CostLedger, HttpCompletionClient};
pub use config::{ConfigError, ConfigLoader};
pub use process::{CommandOutput, SubprocessRunner};
pub use sqlite::{DatabaseConnection, Migrator, SqliteStore};
pub use workspace::WorkspaceManager;
