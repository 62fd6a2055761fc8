//! Thread manager — owner-scoped conversation CRUD with per-thread locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::history::HistoryPolicy;
use super::model::{Message, Thread, ThreadSummary};
use crate::error::ThreadError;

/// One stored thread. The owner is duplicated outside the mutex so listings
/// don't need to lock every thread.
struct ThreadSlot {
    owner: String,
    seq: u64,
    thread: Mutex<Thread>,
}

/// Manages conversation threads for all owners.
pub struct ThreadManager {
    threads: RwLock<HashMap<Uuid, Arc<ThreadSlot>>>,
    next_seq: AtomicU64,
    /// Seeded as the first message of new and reset threads.
    system_prompt: Option<String>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::with_system_prompt(None)
    }

    pub fn with_system_prompt(system_prompt: Option<String>) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            system_prompt,
        }
    }

    fn seed(&self) -> Vec<Message> {
        self.system_prompt
            .iter()
            .map(|prompt| Message::system(prompt.as_str()))
            .collect()
    }

    /// Create a thread for `owner`, seeded with the system prompt if one is set.
    pub async fn create_thread(&self, owner: &str, name: Option<String>) -> Uuid {
        let mut thread = Thread::new(owner, name);
        thread.messages = self.seed();
        let id = thread.id;
        let slot = Arc::new(ThreadSlot {
            owner: owner.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            thread: Mutex::new(thread),
        });
        self.threads.write().await.insert(id, slot);
        info!(thread_id = %id, owner = owner, "Thread created");
        id
    }

    /// Threads owned by `owner`, newest first.
    pub async fn list_threads(&self, owner: &str) -> Vec<ThreadSummary> {
        let mut slots: Vec<Arc<ThreadSlot>> = self
            .threads
            .read()
            .await
            .values()
            .filter(|slot| slot.owner == owner)
            .cloned()
            .collect();
        slots.sort_by(|a, b| b.seq.cmp(&a.seq));

        let mut summaries = Vec::with_capacity(slots.len());
        for slot in slots {
            summaries.push(slot.thread.lock().await.summary());
        }
        summaries
    }

    /// The most recently created thread of `owner`.
    pub async fn get_latest(&self, owner: &str) -> Result<Thread, ThreadError> {
        let latest = self
            .threads
            .read()
            .await
            .values()
            .filter(|slot| slot.owner == owner)
            .max_by_key(|slot| slot.seq)
            .cloned();

        match latest {
            Some(slot) => Ok(slot.thread.lock().await.clone()),
            None => Err(ThreadError::NoThreads {
                owner: owner.to_string(),
            }),
        }
    }

    /// Fetch a thread with its messages.
    pub async fn get(&self, thread_id: Uuid, owner: &str) -> Result<Thread, ThreadError> {
        let slot = self.owned_slot(thread_id, owner).await?;
        let thread = slot.thread.lock().await.clone();
        Ok(thread)
    }

    /// Delete a thread.
    pub async fn delete(&self, thread_id: Uuid, owner: &str) -> Result<(), ThreadError> {
        let mut threads = self.threads.write().await;
        match threads.get(&thread_id) {
            None => return Err(ThreadError::NotFound { id: thread_id }),
            Some(slot) if slot.owner != owner => {
                return Err(ThreadError::Forbidden { id: thread_id });
            }
            Some(_) => {}
        }
        threads.remove(&thread_id);
        info!(thread_id = %thread_id, "Thread deleted");
        Ok(())
    }

    /// Clear a thread's history back to its seed, keeping the thread itself.
    pub async fn reset(&self, thread_id: Uuid, owner: &str) -> Result<(), ThreadError> {
        let slot = self.owned_slot(thread_id, owner).await?;
        let mut thread = slot.thread.lock().await;
        thread.messages = self.seed();
        thread.updated_at = Utc::now();
        info!(thread_id = %thread_id, "Thread history reset");
        Ok(())
    }

    /// Append `message`, trim the stored history to `policy` and return it.
    ///
    /// Appends to the same thread are serialized by its mutex.
    pub async fn append_and_trim(
        &self,
        thread_id: Uuid,
        message: Message,
        policy: &HistoryPolicy,
    ) -> Result<Vec<Message>, ThreadError> {
        let slot = self
            .slot(thread_id)
            .await
            .ok_or(ThreadError::NotFound { id: thread_id })?;

        let mut thread = slot.thread.lock().await;
        thread.messages.push(message);
        let removed = policy.trim(&mut thread.messages);
        thread.updated_at = Utc::now();

        if removed > 0 {
            debug!(
                thread_id = %thread_id,
                removed,
                remaining = thread.messages.len(),
                "Trimmed thread history"
            );
        }

        Ok(thread.messages.clone())
    }

    /// Append `message` and trim to `policy` only if `commit` succeeds.
    ///
    /// `commit` receives the would-be history while the thread stays locked;
    /// on error the stored history is left exactly as it was.
    pub async fn append_with<T, E, F, Fut>(
        &self,
        thread_id: Uuid,
        message: Message,
        policy: &HistoryPolicy,
        commit: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Vec<Message>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ThreadError>,
    {
        let slot = self
            .slot(thread_id)
            .await
            .ok_or(ThreadError::NotFound { id: thread_id })?;

        let mut thread = slot.thread.lock().await;
        let mut history = thread.messages.clone();
        history.push(message);
        let removed = policy.trim(&mut history);

        let committed = commit(history.clone()).await?;

        thread.messages = history;
        thread.updated_at = Utc::now();
        if removed > 0 {
            debug!(thread_id = %thread_id, removed, "Trimmed thread history");
        }
        Ok(committed)
    }

    async fn slot(&self, thread_id: Uuid) -> Option<Arc<ThreadSlot>> {
        self.threads.read().await.get(&thread_id).cloned()
    }

    async fn owned_slot(&self, thread_id: Uuid, owner: &str) -> Result<Arc<ThreadSlot>, ThreadError> {
        let slot = self
            .slot(thread_id)
            .await
            .ok_or(ThreadError::NotFound { id: thread_id })?;
        if slot.owner != owner {
            return Err(ThreadError::Forbidden { id: thread_id });
        }
        Ok(slot)
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}
