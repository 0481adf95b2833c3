//! SQLite connection management.
//!
//! WAL journaling for crash-safe writes, a busy timeout so concurrent
//! writers queue instead of failing, and an integrity check that refuses
//! to start on a corrupt database.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::Row;

use crate::domain::errors::{PipelineError, PipelineResult};

/// Database connection manager with connection pooling.
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Open (or create) the database with WAL mode enabled.
    pub async fn new(database_url: &str, max_connections: u32) -> PipelineResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PipelineError::Storage(format!("invalid database URL: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| PipelineError::Storage(format!("failed to create pool: {e}")))?;

        Ok(Self { pool })
    }

    /// Run `PRAGMA integrity_check`; a failing database refuses to start.
    pub async fn check_integrity(&self) -> PipelineResult<()> {
        let row = sqlx::query("PRAGMA integrity_check")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PipelineError::StorageCorruption(e.to_string()))?;

        let verdict: String = row.get(0);
        if verdict != "ok" {
            return Err(PipelineError::StorageCorruption(verdict));
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_lifecycle() {
        let db = DatabaseConnection::new("sqlite::memory:", 5)
            .await
            .expect("failed to create connection");
        assert!(!db.pool().is_closed());
        db.close().await;
        assert!(db.pool().is_closed());
    }

    #[tokio::test]
    async fn fresh_database_passes_integrity_check() {
        let db = DatabaseConnection::new("sqlite::memory:", 5)
            .await
            .expect("failed to create connection");
        db.check_integrity().await.expect("integrity check failed");
        db.close().await;
    }
}
