//! Conversation threads.
//!
//! - `model` — Thread and Message types
//! - `history` — size bounds and head trimming
//! - `manager` — owner-scoped CRUD with per-thread locking

pub mod history;
pub mod manager;
pub mod model;

pub use history::HistoryPolicy;
pub use manager::ThreadManager;
pub use model::{Message, Role, Thread, ThreadSummary};
