//! Cooperative job cancellation.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::state::JobState;
use super::store::JobStore;
use crate::error::JobError;

/// Result of a cancel request. All variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "state", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// First request; the runner has been signalled.
    Signalled,
    /// Cancellation was already requested; nothing changed.
    AlreadyRequested,
    /// Job had already finished in this state; nothing changed.
    AlreadyTerminal(JobState),
}

/// Delivers cancellation signals to running jobs.
///
/// Only the signal is recorded here. The job's runner performs the actual
/// transition to Cancelled once the pipeline stops.
pub struct CancellationController {
    store: Arc<JobStore>,
}

impl CancellationController {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Request cancellation of `job_id` on behalf of `requester`.
    pub async fn cancel(&self, job_id: Uuid, requester: &str) -> Result<CancelOutcome, JobError> {
        let slot = self.store.slot(job_id).await?;

        if slot.owner() != requester {
            return Err(JobError::Forbidden { id: job_id });
        }

        let state = slot.state();
        if state.is_terminal() {
            debug!(job_id = %job_id, state = %state, "Cancel on finished job ignored");
            return Ok(CancelOutcome::AlreadyTerminal(state));
        }

        if slot.request_cancel() {
            info!(job_id = %job_id, requester = requester, "Cancellation requested");
            Ok(CancelOutcome::Signalled)
        } else {
            Ok(CancelOutcome::AlreadyRequested)
        }
    }
}
