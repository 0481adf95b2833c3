//! Per-run pipeline context.
//!
//! One value threaded through the pipeline carrying the cancellation
//! handle and the run's cost ledger. There is no process-wide "current
//! run" state; everything a phase needs to stop or account arrives
//! through this value.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::infrastructure::ai::CostLedger;

#[derive(Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub ledger: Arc<CostLedger>,
}

impl RunContext {
    pub fn new(ledger: Arc<CostLedger>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ledger,
        }
    }

    /// Cancel everything downstream: new AI calls stop being submitted,
    /// outstanding calls and subprocesses terminate, workspaces release.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_canceled(&self) -> PipelineResult<()> {
        if self.is_canceled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }
}
