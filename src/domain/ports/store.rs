//! Persistence port.
//!
//! Durable lineage from intent to judgment. Every phase writes its
//! artifact through this trait before declaring itself complete; the
//! next phase reads it back. Implementations must make writes
//! crash-safe and serialize conflicting writers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::PipelineResult;
use crate::domain::models::{
    Attempt, AttemptStatus, Intent, Judgment, Specification, Survivor, Verification,
};

#[async_trait]
pub trait Store: Send + Sync {
    // Intents
    async fn save_intent(&self, intent: &Intent) -> PipelineResult<()>;
    async fn get_intent(&self, id: Uuid) -> PipelineResult<Option<Intent>>;
    /// Persist status, parsed form, message, and refinement count.
    async fn update_intent(&self, intent: &Intent) -> PipelineResult<()>;
    async fn list_intents_by_session(&self, session_id: Uuid) -> PipelineResult<Vec<Intent>>;
    /// Every intent not in a terminal state, for startup recovery.
    async fn list_unfinished_intents(&self) -> PipelineResult<Vec<Intent>>;

    // Specifications
    async fn save_spec(&self, spec: &Specification) -> PipelineResult<()>;
    async fn get_spec(&self, id: &str, version: u32) -> PipelineResult<Option<Specification>>;
    /// Highest-version specification for an intent, when any exists.
    async fn latest_spec_for_intent(
        &self,
        intent_id: Uuid,
    ) -> PipelineResult<Option<Specification>>;

    // Attempts
    async fn save_attempt(&self, attempt: &Attempt) -> PipelineResult<()>;
    async fn get_attempt(&self, id: Uuid) -> PipelineResult<Option<Attempt>>;
    async fn update_attempt_status(
        &self,
        id: Uuid,
        status: AttemptStatus,
    ) -> PipelineResult<()>;
    async fn list_attempts_for_spec(
        &self,
        spec_id: &str,
        version: u32,
    ) -> PipelineResult<Vec<Attempt>>;

    // Verifications
    async fn save_verification(&self, verification: &Verification) -> PipelineResult<()>;
    /// Most recent verification for an attempt.
    async fn latest_verification_for_attempt(
        &self,
        attempt_id: Uuid,
    ) -> PipelineResult<Option<Verification>>;

    // Survivors
    async fn save_survivor(&self, survivor: &Survivor) -> PipelineResult<()>;
    async fn get_survivor(&self, id: Uuid) -> PipelineResult<Option<Survivor>>;
    async fn mark_survivor_presented(&self, id: Uuid) -> PipelineResult<()>;
    async fn list_survivors_for_intent(&self, intent_id: Uuid) -> PipelineResult<Vec<Survivor>>;

    // Judgments
    async fn save_judgment(&self, judgment: &Judgment) -> PipelineResult<()>;
    async fn list_judgments_for_intent(&self, intent_id: Uuid) -> PipelineResult<Vec<Judgment>>;

    /// Operator-triggered purge of a session's entire lineage.
    /// Returns the number of deleted intents.
    async fn purge_session(&self, session_id: Uuid) -> PipelineResult<u64>;
}
