//! Stream broker — per-job fan-out of progress events.
//!
//! Each job gets a [`Topic`] backed by a bounded broadcast channel. The job's
//! runner is the only publisher; any number of subscribers can attach at any
//! time. A subscriber sees events from its subscription point onward, or just
//! the terminal event if the job already finished. Subscribers that fall more
//! than the buffer capacity behind are dropped with a backpressure error
//! instead of slowing the publisher.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::event::{EventPayload, StreamEvent};
use crate::error::StreamError;

/// Default per-job buffer capacity.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Events delivered to one subscriber. Ends after the terminal event, after a
/// backpressure error, or when the topic is closed.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

struct TopicState {
    last_sequence: u64,
    terminal: Option<StreamEvent>,
}

/// Event channel for a single job.
pub struct Topic {
    job_id: Uuid,
    tx: broadcast::Sender<StreamEvent>,
    // Sequencing and subscription share this lock so a subscriber can never
    // miss the terminal event between checking for it and subscribing.
    state: Mutex<TopicState>,
}

impl Topic {
    fn new(job_id: Uuid, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            job_id,
            tx,
            state: Mutex::new(TopicState {
                last_sequence: 0,
                terminal: None,
            }),
        }
    }

    /// Publish the next event. Never blocks. Returns the assigned sequence,
    /// or `None` if the terminal event was already published.
    pub fn publish(&self, payload: EventPayload) -> Option<u64> {
        let mut state = self.state.lock();
        if state.terminal.is_some() {
            warn!(
                job_id = %self.job_id,
                kind = payload.kind(),
                "Dropping event published after terminal event"
            );
            return None;
        }

        state.last_sequence += 1;
        let event = StreamEvent {
            job_id: self.job_id,
            sequence: state.last_sequence,
            is_terminal: payload.is_terminal(),
            payload,
        };
        if event.is_terminal {
            state.terminal = Some(event.clone());
        }

        // Err only means nobody is watching right now
        let _ = self.tx.send(event);
        Some(state.last_sequence)
    }

    /// Whether the terminal event has been published.
    pub fn is_finished(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Attach a new subscriber.
    pub fn subscribe(&self) -> EventStream {
        let cursor = {
            let state = self.state.lock();
            match &state.terminal {
                Some(terminal) => Cursor::Replay(terminal.clone()),
                None => Cursor::Live(BroadcastStream::new(self.tx.subscribe())),
            }
        };
        let job_id = self.job_id;

        Box::pin(stream::unfold(cursor, move |cursor| async move {
            match cursor {
                Cursor::Done => None,
                Cursor::Replay(event) => Some((Ok(event), Cursor::Done)),
                Cursor::Live(mut rx) => match rx.next().await {
                    Some(Ok(event)) => {
                        let next = if event.is_terminal {
                            Cursor::Done
                        } else {
                            Cursor::Live(rx)
                        };
                        Some((Ok(event), next))
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                        warn!(job_id = %job_id, missed, "Dropping lagging subscriber");
                        Some((
                            Err(StreamError::BackpressureDropped { job_id, missed }),
                            Cursor::Done,
                        ))
                    }
                    None => {
                        debug!(job_id = %job_id, "Topic closed");
                        None
                    }
                },
            }
        }))
    }
}

enum Cursor {
    Replay(StreamEvent),
    Live(BroadcastStream<StreamEvent>),
    Done,
}

/// Registry of per-job topics.
pub struct StreamBroker {
    topics: RwLock<HashMap<Uuid, Arc<Topic>>>,
    capacity: usize,
}

impl StreamBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Open the topic for a new job. Reopening an existing id returns the
    /// existing topic.
    pub async fn open(&self, job_id: Uuid) -> Arc<Topic> {
        let mut topics = self.topics.write().await;
        Arc::clone(
            topics
                .entry(job_id)
                .or_insert_with(|| Arc::new(Topic::new(job_id, self.capacity))),
        )
    }

    /// Look up a job's topic.
    pub async fn topic(&self, job_id: Uuid) -> Option<Arc<Topic>> {
        self.topics.read().await.get(&job_id).cloned()
    }

    /// Subscribe to a job's events.
    pub async fn subscribe(&self, job_id: Uuid) -> Result<EventStream, StreamError> {
        let topic = self
            .topic(job_id)
            .await
            .ok_or(StreamError::NotFound { job_id })?;
        debug!(
            job_id = %job_id,
            subscribers = topic.subscriber_count() + 1,
            "New stream subscriber"
        );
        Ok(topic.subscribe())
    }

    /// Remove a job's topic. Live subscribers see their stream end.
    pub async fn close(&self, job_id: Uuid) -> bool {
        self.topics.write().await.remove(&job_id).is_some()
    }

    /// Number of open topics.
    pub async fn len(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.topics.read().await.is_empty()
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    fn progress(n: u64) -> EventPayload {
        EventPayload::Progress { data: json!(n) }
    }

    fn done() -> EventPayload {
        EventPayload::Completed {
            result: json!("ok"),
        }
    }

    #[tokio::test]
    async fn subscribe_unknown_job_is_not_found() {
        let broker = StreamBroker::default();
        let err = broker.subscribe(Uuid::new_v4()).await.err().unwrap();
        assert_eq!(err.to_string(), "Task not found");
    }

    #[tokio::test]
    async fn live_subscriber_gets_ordered_events_ending_in_terminal() {
        let broker = StreamBroker::default();
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        let mut events = broker.subscribe(job_id).await.unwrap();

        topic.publish(progress(1));
        topic.publish(progress(2));
        topic.publish(done());

        let received: Vec<StreamEvent> = (&mut events).map(|e| e.unwrap()).collect().await;
        let sequences: Vec<u64> = received.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(received.iter().filter(|e| e.is_terminal).count(), 1);
        assert!(received.last().unwrap().is_terminal);
        assert!(received.iter().all(|e| e.job_id == job_id));
    }

    #[tokio::test]
    async fn late_subscriber_gets_only_terminal_event() {
        let broker = StreamBroker::default();
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        topic.publish(progress(1));
        topic.publish(done());

        let received: Vec<_> = broker.subscribe(job_id).await.unwrap().collect().await;
        assert_eq!(received.len(), 1);
        let event = received[0].as_ref().unwrap();
        assert!(event.is_terminal);
        assert_eq!(event.sequence, 2);
    }

    #[tokio::test]
    async fn mid_run_subscriber_sees_only_later_events() {
        let broker = StreamBroker::default();
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        topic.publish(progress(1));

        let events = broker.subscribe(job_id).await.unwrap();
        topic.publish(progress(2));
        topic.publish(done());

        let sequences: Vec<u64> = events.map(|e| e.unwrap().sequence).collect().await;
        assert_eq!(sequences, vec![2, 3]);
    }

    #[tokio::test]
    async fn nothing_is_published_after_terminal() {
        let topic = Topic::new(Uuid::new_v4(), 8);
        assert_eq!(topic.publish(done()), Some(1));
        assert_eq!(topic.publish(progress(2)), None);
        assert_eq!(
            topic.publish(EventPayload::Failed {
                error: "late".into()
            }),
            None
        );
        assert!(topic.is_finished());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking_publisher() {
        let broker = StreamBroker::new(2);
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        let mut slow = broker.subscribe(job_id).await.unwrap();

        for n in 1..=5 {
            assert_eq!(topic.publish(progress(n)), Some(n));
        }
        topic.publish(done());

        let first = slow.next().await.unwrap();
        assert!(matches!(
            first,
            Err(StreamError::BackpressureDropped { job_id: id, .. }) if id == job_id
        ));
        assert!(slow.next().await.is_none());

        // A fresh subscriber still gets the terminal event
        let late: Vec<_> = broker.subscribe(job_id).await.unwrap().collect().await;
        assert_eq!(late.len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_affect_others() {
        let broker = StreamBroker::default();
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        let gone = broker.subscribe(job_id).await.unwrap();
        let kept = broker.subscribe(job_id).await.unwrap();
        drop(gone);

        topic.publish(progress(1));
        topic.publish(done());
        assert_eq!(topic.subscriber_count(), 1);

        let received: Vec<_> = kept.collect().await;
        assert_eq!(received.len(), 2);
    }

    #[tokio::test]
    async fn close_ends_live_streams_and_forgets_topic() {
        let broker = StreamBroker::default();
        let job_id = Uuid::new_v4();
        let topic = broker.open(job_id).await;
        let events = broker.subscribe(job_id).await.unwrap();

        assert!(broker.close(job_id).await);
        drop(topic);

        let received: Vec<_> = events.collect().await;
        assert!(received.is_empty());
        assert!(broker.subscribe(job_id).await.is_err());
        assert!(broker.is_empty().await);
    }
}
