//! Completion backend port.
//!
//! The pipeline is opaque to the AI provider; it exchanges text prompts
//! for text responses through this trait. Purposes tag every call for
//! cost and quota accounting, nothing more.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a completion is being requested. The gateway accounts per purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    /// Raw message → structured intent.
    Parse,
    /// Codebase → relevant files, patterns, forbidden zones.
    Analyze,
    /// Structured intent + analysis → executable specification.
    Spec,
    /// Specification + strategy → candidate implementation.
    Implement,
    /// Attempt → readability score.
    Score,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Analyze => "analyze",
            Self::Spec => "spec",
            Self::Implement => "implement",
            Self::Score => "score",
        }
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub purpose: Purpose,
    pub max_tokens: u32,
}

/// A completion with the usage needed for cost accounting.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Backend failures, classified for the retry and rate-limit policies.
#[derive(Debug, Clone, Error)]
pub enum CompletionError {
    /// The backend signalled too-many-requests; the gateway halves
    /// effective concurrency when it sees this.
    #[error("Rate limited by completion backend")]
    RateLimited,

    /// Server-side or network failure worth retrying.
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// Bad request, bad credentials, or anything retrying cannot fix.
    #[error("Permanent backend failure: {0}")]
    Permanent(String),

    /// The per-call deadline expired.
    #[error("Completion call exceeded its deadline")]
    DeadlineExceeded,

    /// The caller's cancellation handle fired.
    #[error("Completion call canceled")]
    Canceled,
}

impl CompletionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient(_) | Self::DeadlineExceeded)
    }
}

/// The one operation the pipeline needs from an AI backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError>;
}
