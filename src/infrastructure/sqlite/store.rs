//! SQLite implementation of the Store port.
//!
//! Nested values (parsed intents, assertions, file changes, checks,
//! scores) are stored as JSON columns; identities and status fields are
//! plain columns so listings can filter without deserializing. Writes
//! retry on SQLITE_BUSY with bounded exponential backoff.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{
    Assertion, Attempt, AttemptStatus, CheckResult, Decision, FileChange, Intent, IntentStatus,
    Judgment, ParsedIntent, ScoreCard, Specification, Strategy, Survivor, Verification,
};
use crate::domain::ports::Store;

/// Writers retry this many times on contention before surfacing
/// `storage_contention`.
const BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF_MS: u64 = 20;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn is_busy(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .map(|db| {
                let msg = db.message().to_lowercase();
                msg.contains("database is locked") || msg.contains("database table is locked")
            })
            .unwrap_or(false)
    }

    /// Run a write, retrying on SQLITE_BUSY with exponential backoff.
    async fn with_busy_retry<T, F, Fut>(&self, mut op: F) -> PipelineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if Self::is_busy(&err) && attempt < BUSY_RETRIES => {
                    let backoff = BUSY_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
                    warn!(attempt, backoff_ms = backoff, "store contention, retrying");
                    sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(err) if Self::is_busy(&err) => {
                    return Err(PipelineError::StorageContention(err.to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn parse_ts(raw: &str) -> PipelineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PipelineError::Storage(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> PipelineResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| PipelineError::Storage(format!("bad uuid '{raw}': {e}")))
}

fn row_to_intent(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Intent> {
    let parsed: Option<ParsedIntent> = row
        .get::<Option<String>, _>("parsed")
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let status = IntentStatus::from_str(&row.get::<String, _>("status"))
        .ok_or_else(|| PipelineError::Storage("unknown intent status".into()))?;

    Ok(Intent {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        session_id: parse_uuid(&row.get::<String, _>("session_id"))?,
        raw_message: row.get("raw_message"),
        parsed,
        status,
        refinement_count: row.get::<i64, _>("refinement_count") as u32,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_spec(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Specification> {
    let assertions: Vec<Assertion> = serde_json::from_str(&row.get::<String, _>("assertions"))?;
    let may_touch: BTreeSet<String> = serde_json::from_str(&row.get::<String, _>("may_touch"))?;
    let must_not_touch: BTreeSet<String> =
        serde_json::from_str(&row.get::<String, _>("must_not_touch"))?;
    let patterns: Vec<String> = serde_json::from_str(&row.get::<String, _>("patterns"))?;

    Ok(Specification {
        id: row.get("id"),
        intent_id: parse_uuid(&row.get::<String, _>("intent_id"))?,
        version: row.get::<i64, _>("version") as u32,
        assertions,
        test_suite: row.get("test_suite"),
        type_contract: row.get("type_contract"),
        may_touch,
        must_not_touch,
        patterns,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_attempt(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Attempt> {
    let changes: Vec<FileChange> = serde_json::from_str(&row.get::<String, _>("changes"))?;
    let strategy = Strategy::from_str(&row.get::<String, _>("strategy"))
        .ok_or_else(|| PipelineError::Storage("unknown strategy".into()))?;
    let status = AttemptStatus::from_str(&row.get::<String, _>("status"))
        .ok_or_else(|| PipelineError::Storage("unknown attempt status".into()))?;

    Ok(Attempt {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        spec_id: row.get("spec_id"),
        spec_version: row.get::<i64, _>("spec_version") as u32,
        strategy,
        changes,
        approach: row.get("approach"),
        confidence: row.get("confidence"),
        status,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_verification(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Verification> {
    let checks: Vec<CheckResult> = serde_json::from_str(&row.get::<String, _>("checks"))?;

    Ok(Verification {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        attempt_id: parse_uuid(&row.get::<String, _>("attempt_id"))?,
        passed: row.get::<i64, _>("passed") != 0,
        checks,
        assertions_passed: row.get::<i64, _>("assertions_passed") as u32,
        assertions_total: row.get::<i64, _>("assertions_total") as u32,
        duration_ms: row.get::<i64, _>("duration_ms") as u64,
        first_failure: row.get("first_failure"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_survivor(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Survivor> {
    let score: ScoreCard = serde_json::from_str(&row.get::<String, _>("score"))?;

    Ok(Survivor {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        intent_id: parse_uuid(&row.get::<String, _>("intent_id"))?,
        attempt_id: parse_uuid(&row.get::<String, _>("attempt_id"))?,
        verification_id: parse_uuid(&row.get::<String, _>("verification_id"))?,
        rank: row.get::<i64, _>("rank") as u32,
        score,
        presented: row.get::<i64, _>("presented") != 0,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

fn row_to_judgment(row: &sqlx::sqlite::SqliteRow) -> PipelineResult<Judgment> {
    let decision = Decision::from_str(&row.get::<String, _>("decision"))
        .ok_or_else(|| PipelineError::Storage("unknown decision".into()))?;
    let survivor_id = row
        .get::<Option<String>, _>("survivor_id")
        .as_deref()
        .map(parse_uuid)
        .transpose()?;

    Ok(Judgment {
        id: parse_uuid(&row.get::<String, _>("id"))?,
        intent_id: parse_uuid(&row.get::<String, _>("intent_id"))?,
        survivor_id,
        decision,
        refinement: row.get("refinement"),
        redirect: row.get("redirect"),
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_intent(&self, intent: &Intent) -> PipelineResult<()> {
        let parsed = intent
            .parsed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let parsed = parsed.clone();
            let intent = intent.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO intents
                       (id, session_id, raw_message, parsed, status, refinement_count,
                        created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(intent.id.to_string())
                .bind(intent.session_id.to_string())
                .bind(&intent.raw_message)
                .bind(parsed)
                .bind(intent.status.as_str())
                .bind(intent.refinement_count as i64)
                .bind(intent.created_at.to_rfc3339())
                .bind(intent.updated_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn get_intent(&self, id: Uuid) -> PipelineResult<Option<Intent>> {
        let row = sqlx::query("SELECT * FROM intents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_intent).transpose()
    }

    async fn update_intent(&self, intent: &Intent) -> PipelineResult<()> {
        let parsed = intent
            .parsed
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let affected = self
            .with_busy_retry(|| {
                let pool = self.pool.clone();
                let parsed = parsed.clone();
                let intent = intent.clone();
                async move {
                    sqlx::query(
                        r#"UPDATE intents SET raw_message = ?, parsed = ?, status = ?,
                           refinement_count = ?, updated_at = ? WHERE id = ?"#,
                    )
                    .bind(&intent.raw_message)
                    .bind(parsed)
                    .bind(intent.status.as_str())
                    .bind(intent.refinement_count as i64)
                    .bind(Utc::now().to_rfc3339())
                    .bind(intent.id.to_string())
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(PipelineError::IntentNotFound(intent.id));
        }
        Ok(())
    }

    async fn list_intents_by_session(&self, session_id: Uuid) -> PipelineResult<Vec<Intent>> {
        let rows = sqlx::query("SELECT * FROM intents WHERE session_id = ? ORDER BY created_at")
            .bind(session_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_intent).collect()
    }

    async fn list_unfinished_intents(&self) -> PipelineResult<Vec<Intent>> {
        let rows = sqlx::query(
            "SELECT * FROM intents
             WHERE status NOT IN ('complete', 'failed', 'aborted')
             ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_intent).collect()
    }

    async fn save_spec(&self, spec: &Specification) -> PipelineResult<()> {
        let assertions = serde_json::to_string(&spec.assertions)?;
        let may_touch = serde_json::to_string(&spec.may_touch)?;
        let must_not_touch = serde_json::to_string(&spec.must_not_touch)?;
        let patterns = serde_json::to_string(&spec.patterns)?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let spec = spec.clone();
            let assertions = assertions.clone();
            let may_touch = may_touch.clone();
            let must_not_touch = must_not_touch.clone();
            let patterns = patterns.clone();
            async move {
                sqlx::query(
                    r#"INSERT OR REPLACE INTO specifications
                       (id, version, intent_id, assertions, test_suite, type_contract,
                        may_touch, must_not_touch, patterns, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(&spec.id)
                .bind(spec.version as i64)
                .bind(spec.intent_id.to_string())
                .bind(&assertions)
                .bind(&spec.test_suite)
                .bind(&spec.type_contract)
                .bind(&may_touch)
                .bind(&must_not_touch)
                .bind(&patterns)
                .bind(spec.created_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn get_spec(&self, id: &str, version: u32) -> PipelineResult<Option<Specification>> {
        let row = sqlx::query("SELECT * FROM specifications WHERE id = ? AND version = ?")
            .bind(id)
            .bind(version as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_spec).transpose()
    }

    async fn latest_spec_for_intent(
        &self,
        intent_id: Uuid,
    ) -> PipelineResult<Option<Specification>> {
        let row = sqlx::query(
            "SELECT * FROM specifications WHERE intent_id = ?
             ORDER BY version DESC LIMIT 1",
        )
        .bind(intent_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_spec).transpose()
    }

    async fn save_attempt(&self, attempt: &Attempt) -> PipelineResult<()> {
        let changes = serde_json::to_string(&attempt.changes)?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let attempt = attempt.clone();
            let changes = changes.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO attempts
                       (id, spec_id, spec_version, strategy, changes, approach,
                        confidence, status, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(attempt.id.to_string())
                .bind(&attempt.spec_id)
                .bind(attempt.spec_version as i64)
                .bind(attempt.strategy.as_str())
                .bind(&changes)
                .bind(&attempt.approach)
                .bind(attempt.confidence)
                .bind(attempt.status.as_str())
                .bind(attempt.created_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn get_attempt(&self, id: Uuid) -> PipelineResult<Option<Attempt>> {
        let row = sqlx::query("SELECT * FROM attempts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn update_attempt_status(&self, id: Uuid, status: AttemptStatus) -> PipelineResult<()> {
        let affected = self
            .with_busy_retry(|| {
                let pool = self.pool.clone();
                async move {
                    sqlx::query("UPDATE attempts SET status = ? WHERE id = ?")
                        .bind(status.as_str())
                        .bind(id.to_string())
                        .execute(&pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(PipelineError::AttemptNotFound(id));
        }
        Ok(())
    }

    async fn list_attempts_for_spec(
        &self,
        spec_id: &str,
        version: u32,
    ) -> PipelineResult<Vec<Attempt>> {
        let rows = sqlx::query(
            "SELECT * FROM attempts WHERE spec_id = ? AND spec_version = ?
             ORDER BY created_at",
        )
        .bind(spec_id)
        .bind(version as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn save_verification(&self, verification: &Verification) -> PipelineResult<()> {
        let checks = serde_json::to_string(&verification.checks)?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let v = verification.clone();
            let checks = checks.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO verifications
                       (id, attempt_id, passed, checks, assertions_passed,
                        assertions_total, duration_ms, first_failure, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(v.id.to_string())
                .bind(v.attempt_id.to_string())
                .bind(v.passed as i64)
                .bind(&checks)
                .bind(v.assertions_passed as i64)
                .bind(v.assertions_total as i64)
                .bind(v.duration_ms as i64)
                .bind(&v.first_failure)
                .bind(v.created_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn latest_verification_for_attempt(
        &self,
        attempt_id: Uuid,
    ) -> PipelineResult<Option<Verification>> {
        let row = sqlx::query(
            "SELECT * FROM verifications WHERE attempt_id = ?
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(attempt_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_verification).transpose()
    }

    async fn save_survivor(&self, survivor: &Survivor) -> PipelineResult<()> {
        let score = serde_json::to_string(&survivor.score)?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let s = survivor.clone();
            let score = score.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO survivors
                       (id, intent_id, attempt_id, verification_id, rank, score,
                        presented, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(s.id.to_string())
                .bind(s.intent_id.to_string())
                .bind(s.attempt_id.to_string())
                .bind(s.verification_id.to_string())
                .bind(s.rank as i64)
                .bind(&score)
                .bind(s.presented as i64)
                .bind(s.created_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn get_survivor(&self, id: Uuid) -> PipelineResult<Option<Survivor>> {
        let row = sqlx::query("SELECT * FROM survivors WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_survivor).transpose()
    }

    async fn mark_survivor_presented(&self, id: Uuid) -> PipelineResult<()> {
        let affected = self
            .with_busy_retry(|| {
                let pool = self.pool.clone();
                async move {
                    sqlx::query("UPDATE survivors SET presented = 1 WHERE id = ?")
                        .bind(id.to_string())
                        .execute(&pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;

        if affected == 0 {
            return Err(PipelineError::SurvivorNotFound(id));
        }
        Ok(())
    }

    async fn list_survivors_for_intent(&self, intent_id: Uuid) -> PipelineResult<Vec<Survivor>> {
        let rows = sqlx::query(
            "SELECT * FROM survivors WHERE intent_id = ? ORDER BY created_at, rank",
        )
        .bind(intent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_survivor).collect()
    }

    async fn save_judgment(&self, judgment: &Judgment) -> PipelineResult<()> {
        judgment.validate().map_err(PipelineError::Validation)?;

        self.with_busy_retry(|| {
            let pool = self.pool.clone();
            let j = judgment.clone();
            async move {
                sqlx::query(
                    r#"INSERT INTO judgments
                       (id, intent_id, survivor_id, decision, refinement, redirect, created_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(j.id.to_string())
                .bind(j.intent_id.to_string())
                .bind(j.survivor_id.map(|id| id.to_string()))
                .bind(j.decision.as_str())
                .bind(&j.refinement)
                .bind(&j.redirect)
                .bind(j.created_at.to_rfc3339())
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn list_judgments_for_intent(&self, intent_id: Uuid) -> PipelineResult<Vec<Judgment>> {
        let rows = sqlx::query("SELECT * FROM judgments WHERE intent_id = ? ORDER BY created_at")
            .bind(intent_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_judgment).collect()
    }

    async fn purge_session(&self, session_id: Uuid) -> PipelineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let session = session_id.to_string();

        sqlx::query(
            "DELETE FROM verifications WHERE attempt_id IN (
                 SELECT a.id FROM attempts a
                 JOIN specifications s ON a.spec_id = s.id
                 JOIN intents i ON s.intent_id = i.id
                 WHERE i.session_id = ?)",
        )
        .bind(&session)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM attempts WHERE spec_id IN (
                 SELECT s.id FROM specifications s
                 JOIN intents i ON s.intent_id = i.id
                 WHERE i.session_id = ?)",
        )
        .bind(&session)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM survivors WHERE intent_id IN
                 (SELECT id FROM intents WHERE session_id = ?)",
        )
        .bind(&session)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM judgments WHERE intent_id IN
                 (SELECT id FROM intents WHERE session_id = ?)",
        )
        .bind(&session)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM specifications WHERE intent_id IN
                 (SELECT id FROM intents WHERE session_id = ?)",
        )
        .bind(&session)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query("DELETE FROM intents WHERE session_id = ?")
            .bind(&session)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(deleted)
    }
}
