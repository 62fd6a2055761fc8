//! Job record store for handling multiple concurrent jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::{Job, JobOutcome, JobState};
use crate::error::JobError;

/// A stored job plus the handles its runner and the cancel path share.
pub struct JobSlot {
    record: SyncRwLock<Job>,
    state_tx: watch::Sender<JobState>,
    cancel: CancellationToken,
    cancel_requested: AtomicBool,
}

impl JobSlot {
    fn new(job: Job) -> Self {
        let (state_tx, _) = watch::channel(job.state);
        Self {
            record: SyncRwLock::new(job),
            state_tx,
            cancel: CancellationToken::new(),
            cancel_requested: AtomicBool::new(false),
        }
    }

    /// Point-in-time copy of the record.
    pub fn snapshot(&self) -> Job {
        self.record.read().clone()
    }

    pub fn state(&self) -> JobState {
        self.record.read().state
    }

    pub fn owner(&self) -> String {
        self.record.read().owner.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Raise the cancellation flag. Returns true only for the first request.
    pub fn request_cancel(&self) -> bool {
        let first = !self.cancel_requested.swap(true, Ordering::SeqCst);
        if first {
            self.cancel.cancel();
        }
        first
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Non-terminal transition (Queued -> Running).
    pub fn transition(&self, state: JobState, reason: Option<String>) -> Result<(), JobError> {
        self.record.write().transition_to(state, reason)?;
        self.state_tx.send_replace(state);
        Ok(())
    }

    /// Record the terminal outcome. Fails if the job already finished.
    pub fn finish(&self, outcome: JobOutcome) -> Result<Job, JobError> {
        let job = {
            let mut record = self.record.write();
            record.finish(outcome)?;
            record.clone()
        };
        self.state_tx.send_replace(job.state);
        Ok(job)
    }

    /// Wait until the job reaches a terminal state and return its record.
    pub async fn wait_terminal(&self) -> Job {
        let mut rx = self.state_tx.subscribe();
        // The sender lives in self, so this only returns once the predicate holds
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.snapshot()
    }
}

/// Tracks every job's record for its lifetime plus the retention window.
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Arc<JobSlot>>>,
    /// Maximum number of non-terminal jobs (0 = unlimited).
    max_active: usize,
}

impl JobStore {
    pub fn new(max_active: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            max_active,
        }
    }

    /// Register a new job.
    pub async fn insert(&self, job: Job) -> Result<Arc<JobSlot>, JobError> {
        let mut jobs = self.jobs.write().await;

        if jobs.contains_key(&job.id) {
            return Err(JobError::AlreadyExists { id: job.id });
        }

        if self.max_active > 0 {
            let active = jobs.values().filter(|slot| slot.state().is_active()).count();
            if active >= self.max_active {
                return Err(JobError::AtCapacity {
                    max: self.max_active,
                });
            }
        }

        let id = job.id;
        let slot = Arc::new(JobSlot::new(job));
        jobs.insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    pub async fn slot(&self, job_id: Uuid) -> Result<Arc<JobSlot>, JobError> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(JobError::NotFound { id: job_id })
    }

    /// Get a snapshot of a job record.
    pub async fn get(&self, job_id: Uuid) -> Result<Job, JobError> {
        Ok(self.slot(job_id).await?.snapshot())
    }

    /// List all active job IDs.
    pub async fn active_jobs(&self) -> Vec<Uuid> {
        self.jobs
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.state().is_active())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|slot| slot.state().is_active())
            .count()
    }

    /// Drop terminal jobs that finished more than `ttl` ago. Returns their ids.
    pub async fn evict_expired(&self, ttl: Duration) -> Vec<Uuid> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let expired: Vec<Uuid> = jobs
            .iter()
            .filter(|(_, slot)| slot.record.read().is_expired(ttl, now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }

    /// Get summary of all jobs.
    pub async fn summary(&self) -> JobSummary {
        let jobs = self.jobs.read().await;

        let mut summary = JobSummary::default();
        for slot in jobs.values() {
            match slot.state() {
                JobState::Queued => summary.queued += 1,
                JobState::Running => summary.running += 1,
                JobState::Completed => summary.completed += 1,
                JobState::Failed => summary.failed += 1,
                JobState::Cancelled => summary.cancelled += 1,
            }
        }

        summary.total = jobs.len();
        summary
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Summary of all stored jobs.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
