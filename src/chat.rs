//! Chat service — runs one conversation turn as a job.
//!
//! A turn submits a chat job carrying the thread's history plus the user's
//! message (trimmed), records that history on the thread once the job is
//! accepted, and after the job completes appends the assistant's reply.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::jobs::{JobState, Scheduler};
use crate::pipeline::JobInput;
use crate::threads::{HistoryPolicy, Message, ThreadManager};

pub struct ChatService {
    threads: Arc<ThreadManager>,
    scheduler: Arc<Scheduler>,
    policy: HistoryPolicy,
}

impl ChatService {
    pub fn new(threads: Arc<ThreadManager>, scheduler: Arc<Scheduler>, policy: HistoryPolicy) -> Self {
        Self {
            threads,
            scheduler,
            policy,
        }
    }

    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    /// Start a chat turn on `thread_id` and return the job id.
    pub async fn submit_turn(
        &self,
        thread_id: Uuid,
        owner: &str,
        content: &str,
    ) -> Result<Uuid, Error> {
        self.threads.get(thread_id, owner).await?;

        // Reject bad input before the thread is touched
        self.scheduler.validate(&JobInput::Chat {
            thread_id,
            message: content.to_string(),
            history: Vec::new(),
        })?;

        // The user message and its trim are only stored once the job is accepted
        let scheduler = &self.scheduler;
        let job_id = self
            .threads
            .append_with(
                thread_id,
                Message::user(content),
                &self.policy,
                |history| async move {
                    let input = JobInput::Chat {
                        thread_id,
                        message: content.to_string(),
                        history,
                    };
                    scheduler.submit(input, owner).await.map_err(Error::from)
                },
            )
            .await?;

        debug!(thread_id = %thread_id, job_id = %job_id, "Chat turn submitted");

        let threads = Arc::clone(&self.threads);
        let scheduler = Arc::clone(&self.scheduler);
        let policy = self.policy;
        tokio::spawn(async move {
            let job = match scheduler.wait(job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Chat job vanished before completion");
                    return;
                }
            };
            if job.state != JobState::Completed {
                debug!(job_id = %job_id, state = %job.state, "No reply recorded");
                return;
            }

            let reply = match job.result {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                None => return,
            };
            if let Err(e) = threads
                .append_and_trim(thread_id, Message::assistant(reply), &policy)
                .await
            {
                // Thread deleted while the turn ran
                debug!(thread_id = %thread_id, error = %e, "Dropping chat reply");
            }
        });

        Ok(job_id)
    }
}
