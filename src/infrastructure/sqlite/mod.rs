//! SQLite persistence adapter.

pub mod connection;
pub mod migrations;
pub mod store;

pub use connection::DatabaseConnection;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use store::SqliteStore;
