//! Stream events — the ordered progress messages of one job.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobOutcome;

/// Body of a stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Opaque progress from the pipeline.
    Progress { data: serde_json::Value },
    /// Job completed with a result.
    Completed { result: serde_json::Value },
    /// Job failed (pipeline error, panic or timeout).
    Failed { error: String },
    /// Job was cancelled.
    Cancelled {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl EventPayload {
    /// Whether this payload ends the job's stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }

    /// Event name (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<&JobOutcome> for EventPayload {
    fn from(outcome: &JobOutcome) -> Self {
        match outcome {
            JobOutcome::Completed(result) => Self::Completed {
                result: result.clone(),
            },
            JobOutcome::Failed(error) => Self::Failed {
                error: error.clone(),
            },
            JobOutcome::Cancelled(reason) => Self::Cancelled {
                reason: reason.clone(),
            },
        }
    }
}

/// One unit of progress for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub job_id: Uuid,
    /// Per-job sequence number, starting at 1.
    pub sequence: u64,
    pub is_terminal: bool,
    pub payload: EventPayload,
}
