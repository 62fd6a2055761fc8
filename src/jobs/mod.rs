//! Job execution core.
//!
//! - `state` — Job record and state machine (Queued → Running → Completed/Failed/Cancelled)
//! - `store` — JobStore holding every record until eviction
//! - `scheduler` — submission and one runner task per job
//! - `cancel` — cooperative cancellation requests

pub mod cancel;
pub mod scheduler;
pub mod state;
pub mod store;

pub use cancel::{CancelOutcome, CancellationController};
pub use scheduler::{Scheduler, SchedulerConfig, spawn_eviction_task};
pub use state::{Job, JobOutcome, JobState, StateTransition};
pub use store::{JobSlot, JobStore, JobSummary};
