//! Job state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::pipeline::JobInput;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is recorded but its runner has not started work.
    Queued,
    /// Job is executing against the pipeline.
    Running,
    /// Pipeline produced a result.
    Completed,
    /// Pipeline reported an error, panicked or timed out.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Queued
            (Queued, Running) | (Queued, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: JobState,
    /// New state.
    pub to: JobState,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Reason for the transition.
    pub reason: Option<String>,
}

/// How a job's execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
    Cancelled(Option<String>),
}

impl JobOutcome {
    /// The terminal state this outcome maps to.
    pub fn state(&self) -> JobState {
        match self {
            Self::Completed(_) => JobState::Completed,
            Self::Failed(_) => JobState::Failed,
            Self::Cancelled(_) => JobState::Cancelled,
        }
    }
}

/// One tracked unit of asynchronous execution.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Unique job ID.
    pub id: Uuid,
    /// Principal that submitted the job.
    pub owner: String,
    /// Current state.
    pub state: JobState,
    /// Payload handed to the pipeline.
    pub input: JobInput,
    /// Terminal result, set only on completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Terminal error, set only on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the runner started work.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// State transition history.
    pub transitions: Vec<StateTransition>,
}

impl Job {
    /// Create a queued job.
    pub fn new(owner: impl Into<String>, input: JobInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            state: JobState::Queued,
            input,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: JobState,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.state,
                target: new_state,
            });
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason,
        });
        self.state = new_state;

        match new_state {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }

        Ok(())
    }

    /// Move into the terminal state matching `outcome` and record its payload.
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<(), JobError> {
        match outcome {
            JobOutcome::Completed(result) => {
                self.transition_to(JobState::Completed, None)?;
                self.result = Some(result);
            }
            JobOutcome::Failed(error) => {
                self.transition_to(JobState::Failed, Some(error.clone()))?;
                self.error = Some(error);
            }
            JobOutcome::Cancelled(reason) => {
                self.transition_to(JobState::Cancelled, reason)?;
            }
        }
        Ok(())
    }

    /// Get the duration since the job started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            let duration = end.signed_duration_since(start);
            duration.to_std().unwrap_or_default()
        })
    }

    /// Whether this job is terminal and finished more than `ttl` before `now`.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match (self.state.is_terminal(), self.finished_at) {
            (true, Some(finished)) => now
                .signed_duration_since(finished)
                .to_std()
                .is_ok_and(|age| age >= ttl),
            _ => false,
        }
    }
}
