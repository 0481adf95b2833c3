//! Survivor domain model.
//!
//! A Survivor is an Attempt whose Verification passed, ranked among its
//! peers and presented to the human for judgment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-axis scores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    /// Weighted fraction of passing assertions. Always 1.0 for survivors.
    pub assertions: f64,
    /// Monotone decreasing in changed lines and brace nesting.
    pub simplicity: f64,
    /// AI-assessed, or a neutral value when the assessment is unavailable.
    pub readability: f64,
    /// Reserved; 1.0 unless benchmark data exists.
    pub performance: f64,
    pub overall: f64,
}

impl ScoreCard {
    /// Whether every axis lies in the unit interval.
    pub fn in_unit_range(&self) -> bool {
        [
            self.assertions,
            self.simplicity,
            self.readability,
            self.performance,
            self.overall,
        ]
        .iter()
        .all(|v| (0.0..=1.0).contains(v))
    }
}

/// A passing attempt with its rank in the presented set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survivor {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub attempt_id: Uuid,
    pub verification_id: Uuid,
    /// 1-based; ranks of one presentation form a permutation of 1..=K.
    pub rank: u32,
    pub score: ScoreCard,
    pub presented: bool,
    pub created_at: DateTime<Utc>,
}

impl Survivor {
    pub fn new(
        intent_id: Uuid,
        attempt_id: Uuid,
        verification_id: Uuid,
        rank: u32,
        score: ScoreCard,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            attempt_id,
            verification_id,
            rank,
            score,
            presented: false,
            created_at: Utc::now(),
        }
    }
}
