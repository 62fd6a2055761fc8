//! Error types for the crew runner.

use uuid::Uuid;

use crate::jobs::JobState;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Thread error: {0}")]
    Thread(#[from] ThreadError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Conflicting configuration: {0}")]
    Conflict(String),
}

/// Job submission and lookup errors.
///
/// Failures that happen while a job executes are never returned from here;
/// they are recorded on the job and delivered through its terminal event.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid job input: {reason}")]
    InvalidInput { reason: String },

    #[error("Job {id} is owned by another principal")]
    Forbidden { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: JobState,
        target: JobState,
    },

    #[error("Maximum active jobs ({max}) exceeded")]
    AtCapacity { max: usize },

    #[error("Job {id} already exists")]
    AlreadyExists { id: Uuid },
}

/// Stream subscription errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Task not found")]
    NotFound { job_id: Uuid },

    #[error("Subscriber for job {job_id} dropped after falling {missed} events behind")]
    BackpressureDropped { job_id: Uuid, missed: u64 },
}

/// Thread/conversation errors.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    #[error("Thread {id} not found")]
    NotFound { id: Uuid },

    #[error("Thread {id} is owned by another principal")]
    Forbidden { id: Uuid },

    #[error("No threads found for owner {owner}")]
    NoThreads { owner: String },
}

/// Errors reported by an execution pipeline before it starts streaming.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Input rejected: {0}")]
    InvalidInput(String),
}
