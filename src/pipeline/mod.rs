//! Execution pipeline boundary.
//!
//! The agent/crew logic lives behind [`ExecutionPipeline`]. The job core only
//! hands it a [`JobInput`] plus a cancellation token and consumes the lazy
//! [`ProgressStream`] it returns:
//!
//! ```text
//! Progress* ( Result | Error | Cancelled )
//! ```
//!
//! Anything emitted after the first terminator is ignored.

pub mod echo;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::threads::Message;

pub use echo::EchoPipeline;

/// Payload handed to the pipeline for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    /// One chat turn, with the trimmed thread history as context.
    Chat {
        thread_id: Uuid,
        message: String,
        history: Vec<Message>,
    },
    /// A direct crew invocation.
    Crew { crew_id: String, input: String },
}

impl JobInput {
    /// The user-supplied text of this input.
    pub fn text(&self) -> &str {
        match self {
            Self::Chat { message, .. } => message,
            Self::Crew { input, .. } => input,
        }
    }
}

/// One item produced by a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineItem {
    /// Opaque progress data (tokens, tool calls, steps).
    Progress(serde_json::Value),
    /// Final result; ends the run.
    Result(serde_json::Value),
    /// Reported failure; ends the run.
    Error(String),
    /// The pipeline observed the cancellation token and stopped.
    Cancelled,
}

pub type ProgressStream = Pin<Box<dyn Stream<Item = PipelineItem> + Send>>;

/// Pluggable agent/crew execution.
#[async_trait]
pub trait ExecutionPipeline: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Reject input before a job is created.
    fn validate(&self, _input: &JobInput) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Start executing `input`. The pipeline should check `cancel` at its own
    /// checkpoints and yield [`PipelineItem::Cancelled`] once it stops.
    async fn run(
        &self,
        input: JobInput,
        cancel: CancellationToken,
    ) -> Result<ProgressStream, PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_input_serializes_with_kind_tag() {
        let input = JobInput::Crew {
            crew_id: "12".to_string(),
            input: "analyze".to_string(),
        };
        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["kind"], "crew");
        assert_eq!(json["crew_id"], "12");
        assert_eq!(input.text(), "analyze");
    }
}
