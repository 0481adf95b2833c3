//! Pipeline events.
//!
//! A closed, exhaustive union of everything the pipeline reports while
//! running. Consumers match on variants; adding one is a compile error
//! at every handler until it is covered.

use uuid::Uuid;

use super::attempt::Strategy;
use super::intent::IntentStatus;
use super::judgment::Decision;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    PhaseStarted {
        intent_id: Uuid,
        phase: IntentStatus,
    },
    PhaseCompleted {
        intent_id: Uuid,
        phase: IntentStatus,
    },
    ClarificationNeeded {
        intent_id: Uuid,
        questions: Vec<String>,
    },
    AttemptGenerated {
        attempt_id: Uuid,
        strategy: Strategy,
    },
    AttemptDiscarded {
        strategy: Strategy,
        reason: String,
    },
    CostCeilingReached {
        intent_id: Uuid,
        spent_usd: f64,
    },
    VerificationFinished {
        attempt_id: Uuid,
        passed: bool,
        first_failure: Option<String>,
    },
    SurvivorsRanked {
        intent_id: Uuid,
        count: usize,
    },
    /// All attempts collapsed to one after dedup.
    LowDiversity {
        intent_id: Uuid,
    },
    NoSurvivors {
        intent_id: Uuid,
        top_reasons: Vec<String>,
    },
    RefinementLoopWarning {
        intent_id: Uuid,
        count: u32,
    },
    JudgmentReceived {
        intent_id: Uuid,
        decision: Decision,
    },
    IntentFinished {
        intent_id: Uuid,
        status: IntentStatus,
    },
}

/// Non-blocking event emitter. Dropping the receiver silently disables
/// emission; the pipeline never stalls on a slow consumer.
#[derive(Clone)]
pub struct EventSender {
    tx: Option<tokio::sync::mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventSender {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// An emitter that discards everything; used in tests and one-shot tools.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
