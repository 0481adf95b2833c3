//! Judgment domain model.
//!
//! The human's decision over presented survivors: accept one, refine the
//! spec, redirect to a fresh intent, or abort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Refine,
    Redirect,
    Abort,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Refine => "refine",
            Self::Redirect => "redirect",
            Self::Abort => "abort",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(Self::Accept),
            "refine" => Some(Self::Refine),
            "redirect" => Some(Self::Redirect),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgment {
    pub id: Uuid,
    pub intent_id: Uuid,
    pub survivor_id: Option<Uuid>,
    pub decision: Decision,
    pub refinement: Option<String>,
    pub redirect: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Judgment {
    pub fn accept(intent_id: Uuid, survivor_id: Uuid) -> Self {
        Self::build(intent_id, Some(survivor_id), Decision::Accept, None, None)
    }

    pub fn refine(intent_id: Uuid, text: impl Into<String>) -> Self {
        Self::build(intent_id, None, Decision::Refine, Some(text.into()), None)
    }

    pub fn redirect(intent_id: Uuid, text: impl Into<String>) -> Self {
        Self::build(intent_id, None, Decision::Redirect, None, Some(text.into()))
    }

    pub fn abort(intent_id: Uuid) -> Self {
        Self::build(intent_id, None, Decision::Abort, None, None)
    }

    fn build(
        intent_id: Uuid,
        survivor_id: Option<Uuid>,
        decision: Decision,
        refinement: Option<String>,
        redirect: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            intent_id,
            survivor_id,
            decision,
            refinement,
            redirect,
            created_at: Utc::now(),
        }
    }

    /// Check the decision/payload invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self.decision {
            Decision::Accept if self.survivor_id.is_none() => {
                Err("accept requires a survivor id".into())
            }
            Decision::Refine
                if self.refinement.as_deref().map_or(true, |t| t.trim().is_empty()) =>
            {
                Err("refine requires refinement text".into())
            }
            Decision::Redirect
                if self.redirect.as_deref().map_or(true, |t| t.trim().is_empty()) =>
            {
                Err("redirect requires redirect text".into())
            }
            _ => Ok(()),
        }
    }
}
