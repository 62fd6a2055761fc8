//! Job scheduler — submission, execution and terminal bookkeeping.
//!
//! Every submitted job gets its own runner task. The runner is the single
//! writer for that job's record and stream topic:
//! - `submit()` validates, records the job as Queued and spawns the runner
//! - the runner moves the job to Running, drives the pipeline's progress
//!   stream into the topic, then records the terminal outcome and publishes
//!   the terminal event
//! - pipeline errors, panics and timeouts all end as Failed and never reach
//!   the submitter

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::state::{Job, JobOutcome, JobState};
use super::store::{JobSlot, JobStore};
use crate::config::RuntimeConfig;
use crate::error::JobError;
use crate::pipeline::{ExecutionPipeline, JobInput, PipelineItem};
use crate::stream::{EventPayload, StreamBroker, Topic};

/// Scheduler settings.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Jobs running longer than this are failed (None = unbounded).
    pub execution_timeout: Option<Duration>,
}

impl From<&RuntimeConfig> for SchedulerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            execution_timeout: config.execution_timeout,
        }
    }
}

/// Accepts jobs and runs each one against the execution pipeline.
pub struct Scheduler {
    config: SchedulerConfig,
    pipeline: Arc<dyn ExecutionPipeline>,
    store: Arc<JobStore>,
    broker: Arc<StreamBroker>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        pipeline: Arc<dyn ExecutionPipeline>,
        store: Arc<JobStore>,
        broker: Arc<StreamBroker>,
    ) -> Self {
        Self {
            config,
            pipeline,
            store,
            broker,
        }
    }

    /// Check `input` against the pipeline without creating a job.
    pub fn validate(&self, input: &JobInput) -> Result<(), JobError> {
        self.pipeline
            .validate(input)
            .map_err(|e| JobError::InvalidInput {
                reason: e.to_string(),
            })
    }

    /// Create a Queued job and start it in the background. Returns as soon as
    /// the record exists.
    pub async fn submit(&self, input: JobInput, owner: &str) -> Result<Uuid, JobError> {
        self.validate(&input)?;

        let job = Job::new(owner, input.clone());
        let job_id = job.id;
        let slot = self.store.insert(job).await?;
        // Topic exists before the runner starts so early subscribers see every event
        let topic = self.broker.open(job_id).await;

        info!(
            job_id = %job_id,
            owner = owner,
            pipeline = self.pipeline.name(),
            "Job submitted"
        );

        let runner = JobRunner {
            job_id,
            input,
            slot,
            topic,
            pipeline: Arc::clone(&self.pipeline),
            timeout: self.config.execution_timeout,
        };
        tokio::spawn(runner.run());

        Ok(job_id)
    }

    /// Snapshot of a job.
    pub async fn get(&self, job_id: Uuid) -> Result<Job, JobError> {
        self.store.get(job_id).await
    }

    /// Wait for a job to reach a terminal state.
    pub async fn wait(&self, job_id: Uuid) -> Result<Job, JobError> {
        let slot = self.store.slot(job_id).await?;
        Ok(slot.wait_terminal().await)
    }

    /// Evict terminal jobs older than `ttl` along with their topics.
    pub async fn evict_expired(&self, ttl: Duration) -> usize {
        let evicted = self.store.evict_expired(ttl).await;
        for job_id in &evicted {
            self.broker.close(*job_id).await;
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted expired jobs");
        }
        evicted.len()
    }

    /// Signal cancellation to every active job.
    pub async fn shutdown(&self) {
        let active = self.store.active_jobs().await;
        info!(count = active.len(), "Cancelling active jobs");
        for job_id in active {
            if let Ok(slot) = self.store.slot(job_id).await {
                slot.request_cancel();
            }
        }
    }

    /// Get access to the job store.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Get access to the stream broker.
    pub fn broker(&self) -> &Arc<StreamBroker> {
        &self.broker
    }
}

/// Periodically evict expired jobs. Runs until the returned handle is aborted.
pub fn spawn_eviction_task(
    scheduler: Arc<Scheduler>,
    ttl: Duration,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            scheduler.evict_expired(ttl).await;
        }
    })
}

/// Everything one job's runner task owns.
struct JobRunner {
    job_id: Uuid,
    input: JobInput,
    slot: Arc<JobSlot>,
    topic: Arc<Topic>,
    pipeline: Arc<dyn ExecutionPipeline>,
    timeout: Option<Duration>,
}

impl JobRunner {
    async fn run(self) {
        let cancel = self.slot.cancel_token();

        let outcome = if cancel.is_cancelled() {
            JobOutcome::Cancelled(Some("Cancelled before start".to_string()))
        } else {
            match self.slot.transition(JobState::Running, None) {
                Ok(()) => {
                    debug!(job_id = %self.job_id, "Job running");
                    self.execute(cancel).await
                }
                Err(e) => {
                    error!(job_id = %self.job_id, error = %e, "Could not start job");
                    JobOutcome::Failed(e.to_string())
                }
            }
        };

        self.finalize(outcome);
    }

    async fn execute(&self, cancel: CancellationToken) -> JobOutcome {
        let mut handle = tokio::spawn(drive(
            Arc::clone(&self.pipeline),
            self.input.clone(),
            cancel.clone(),
            Arc::clone(&self.topic),
        ));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    cancel.cancel();
                    handle.abort();
                    warn!(
                        job_id = %self.job_id,
                        timeout_secs = limit.as_secs_f64(),
                        "Job timed out"
                    );
                    return JobOutcome::Failed(format!(
                        "Execution timed out after {}s",
                        limit.as_secs_f64()
                    ));
                }
            },
            None => handle.await,
        };

        joined.unwrap_or_else(|e| {
            error!(job_id = %self.job_id, error = %e, "Pipeline task failed");
            JobOutcome::Failed(join_failure(e))
        })
    }

    fn finalize(&self, outcome: JobOutcome) {
        let payload = EventPayload::from(&outcome);
        match self.slot.finish(outcome) {
            Ok(job) => {
                self.topic.publish(payload);
                info!(
                    job_id = %self.job_id,
                    state = %job.state,
                    elapsed_ms = job.elapsed().map(|d| d.as_millis() as u64),
                    "Job finished"
                );
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Dropping second terminal outcome");
            }
        }
    }
}

/// Relay pipeline progress into the topic until a terminator arrives.
async fn drive(
    pipeline: Arc<dyn ExecutionPipeline>,
    input: JobInput,
    cancel: CancellationToken,
    topic: Arc<Topic>,
) -> JobOutcome {
    let mut items = match pipeline.run(input, cancel.clone()).await {
        Ok(items) => items,
        Err(e) => return JobOutcome::Failed(e.to_string()),
    };

    while let Some(item) = items.next().await {
        match item {
            PipelineItem::Progress(data) => {
                topic.publish(EventPayload::Progress { data });
            }
            PipelineItem::Result(result) => return JobOutcome::Completed(result),
            PipelineItem::Error(error) => return JobOutcome::Failed(error),
            PipelineItem::Cancelled => {
                return JobOutcome::Cancelled(Some("Cancelled by request".to_string()));
            }
        }
    }

    if cancel.is_cancelled() {
        JobOutcome::Cancelled(Some("Cancelled by request".to_string()))
    } else {
        JobOutcome::Failed("Pipeline ended without a result".to_string())
    }
}

fn join_failure(e: JoinError) -> String {
    if e.is_panic() {
        format!("Pipeline panicked: {}", panic_message(e.into_panic()))
    } else {
        format!("Pipeline task aborted: {e}")
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::error::PipelineError;
    use crate::pipeline::{EchoPipeline, ProgressStream};
    use crate::stream::StreamEvent;

    /// Emits a fixed script of items.
    struct Scripted(Vec<PipelineItem>);

    #[async_trait]
    impl ExecutionPipeline for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run(
            &self,
            _input: JobInput,
            _cancel: CancellationToken,
        ) -> Result<ProgressStream, PipelineError> {
            Ok(Box::pin(stream::iter(self.0.clone())))
        }
    }

    /// Panics once polled.
    struct Panicking;

    #[async_trait]
    impl ExecutionPipeline for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(
            &self,
            _input: JobInput,
            _cancel: CancellationToken,
        ) -> Result<ProgressStream, PipelineError> {
            panic!("agent exploded");
        }
    }

    /// Never finishes and ignores cancellation.
    struct Stuck;

    #[async_trait]
    impl ExecutionPipeline for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn run(
            &self,
            _input: JobInput,
            _cancel: CancellationToken,
        ) -> Result<ProgressStream, PipelineError> {
            Ok(Box::pin(stream::pending::<PipelineItem>()))
        }
    }

    /// Counts calls to `run`.
    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl ExecutionPipeline for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(
            &self,
            _input: JobInput,
            _cancel: CancellationToken,
        ) -> Result<ProgressStream, PipelineError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(stream::iter(vec![PipelineItem::Result(json!("ran"))])))
        }
    }

    fn crew(input: &str) -> JobInput {
        JobInput::Crew {
            crew_id: "1".to_string(),
            input: input.to_string(),
        }
    }

    fn scheduler_with(pipeline: Arc<dyn ExecutionPipeline>, timeout: Option<Duration>) -> Scheduler {
        Scheduler::new(
            SchedulerConfig {
                execution_timeout: timeout,
            },
            pipeline,
            Arc::new(JobStore::default()),
            Arc::new(StreamBroker::default()),
        )
    }

    fn echo_scheduler() -> Scheduler {
        scheduler_with(Arc::new(EchoPipeline::new(Duration::from_millis(1))), None)
    }

    async fn collect(scheduler: &Scheduler, job_id: Uuid) -> Vec<StreamEvent> {
        scheduler
            .broker()
            .subscribe(job_id)
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn submit_streams_progress_then_terminal() {
        let scheduler = echo_scheduler();
        let job_id = scheduler.submit(crew("hello big world"), "u").await.unwrap();
        let events = collect(&scheduler, job_id).await;

        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(events.iter().filter(|e| e.is_terminal).count(), 1);
        let last = events.last().unwrap();
        assert_eq!(
            last.payload,
            EventPayload::Completed {
                result: json!("hello big world")
            }
        );

        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(json!("hello big world")));
        let states: Vec<JobState> = job.transitions.iter().map(|t| t.to).collect();
        assert_eq!(states, vec![JobState::Running, JobState::Completed]);
    }

    #[tokio::test]
    async fn invalid_input_creates_no_job() {
        let scheduler = echo_scheduler();
        let err = scheduler.submit(crew("   "), "u").await.unwrap_err();
        assert!(matches!(err, JobError::InvalidInput { .. }));
        assert_eq!(scheduler.store().summary().await.total, 0);
        assert!(scheduler.broker().is_empty().await);
    }

    #[tokio::test]
    async fn pipeline_error_fails_job() {
        let scheduler = scheduler_with(
            Arc::new(Scripted(vec![
                PipelineItem::Progress(json!(1)),
                PipelineItem::Error("model unavailable".into()),
            ])),
            None,
        );
        let job_id = scheduler.submit(crew("x"), "u").await.unwrap();
        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("model unavailable"));
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn items_after_terminator_are_ignored() {
        let scheduler = scheduler_with(
            Arc::new(Scripted(vec![
                PipelineItem::Result(json!("first")),
                PipelineItem::Progress(json!("late")),
                PipelineItem::Error("late".into()),
            ])),
            None,
        );
        let job_id = scheduler.submit(crew("x"), "u").await.unwrap();
        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.result, Some(json!("first")));

        let events = collect(&scheduler, job_id).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
    }

    #[tokio::test]
    async fn stream_without_terminator_fails() {
        let scheduler = scheduler_with(
            Arc::new(Scripted(vec![PipelineItem::Progress(json!(1))])),
            None,
        );
        let job_id = scheduler.submit(crew("x"), "u").await.unwrap();
        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("without a result"));
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let scheduler = scheduler_with(Arc::new(Panicking), None);
        let job_id = scheduler.submit(crew("x"), "u").await.unwrap();
        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("agent exploded"));

        let events = collect(&scheduler, job_id).await;
        assert!(matches!(events[0].payload, EventPayload::Failed { .. }));
    }

    #[tokio::test]
    async fn timeout_fails_job_with_terminal_event() {
        let scheduler = scheduler_with(Arc::new(Stuck), Some(Duration::from_millis(50)));
        let job_id = scheduler.submit(crew("x"), "u").await.unwrap();
        let mut events = scheduler.broker().subscribe(job_id).await.unwrap();

        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("timed out"));

        let terminal = events.next().await.unwrap().unwrap();
        assert!(terminal.is_terminal);
        assert!(matches!(terminal.payload, EventPayload::Failed { .. }));
    }

    #[tokio::test]
    async fn cancel_stops_cooperative_pipeline() {
        let scheduler = scheduler_with(Arc::new(EchoPipeline::new(Duration::from_secs(5))), None);
        let job_id = scheduler.submit(crew("a b c d"), "u").await.unwrap();

        scheduler.store().slot(job_id).await.unwrap().request_cancel();
        let job = tokio::time::timeout(Duration::from_secs(2), scheduler.wait(job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Cancelled);

        let events = collect(&scheduler, job_id).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EventPayload::Cancelled { .. }));
    }

    #[tokio::test]
    async fn cancel_before_start_never_runs_pipeline() {
        let pipeline = Arc::new(Counting::default());
        let scheduler = scheduler_with(pipeline.clone(), None);

        // Single-threaded runtime: the runner can't start before we yield
        let job_id = scheduler.submit(crew("never"), "u").await.unwrap();
        scheduler.store().slot(job_id).await.unwrap().request_cancel();

        let job = scheduler.wait(job_id).await.unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.finished_at.is_some());
        let path: Vec<(JobState, JobState)> =
            job.transitions.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(path, [(JobState::Queued, JobState::Cancelled)]);
        assert_eq!(
            job.transitions[0].reason.as_deref(),
            Some("Cancelled before start")
        );
        assert_eq!(pipeline.0.load(Ordering::SeqCst), 0);

        let events = collect(&scheduler, job_id).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload, EventPayload::Cancelled { .. }));
    }

    #[tokio::test]
    async fn concurrent_jobs_are_isolated() {
        let scheduler = Arc::new(echo_scheduler());

        let submits: Vec<_> = (0..100)
            .map(|i| {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move {
                    scheduler
                        .submit(crew(&format!("job {i}")), "u")
                        .await
                        .unwrap()
                })
            })
            .collect();
        let mut ids = Vec::new();
        for submit in submits {
            ids.push(submit.await.unwrap());
        }
        let distinct: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 100);

        for job_id in ids {
            let events = collect(&scheduler, job_id).await;
            assert!(events.iter().all(|e| e.job_id == job_id));
            let job = scheduler.wait(job_id).await.unwrap();
            assert!(job.state.is_terminal());
        }
    }

    #[tokio::test]
    async fn eviction_forgets_job_and_topic() {
        let scheduler = echo_scheduler();
        let job_id = scheduler.submit(crew("bye"), "u").await.unwrap();
        scheduler.wait(job_id).await.unwrap();

        assert_eq!(scheduler.evict_expired(Duration::ZERO).await, 1);
        assert!(matches!(
            scheduler.get(job_id).await,
            Err(JobError::NotFound { .. })
        ));
        assert!(scheduler.broker().subscribe(job_id).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_cancels_active_jobs() {
        let scheduler = scheduler_with(Arc::new(EchoPipeline::new(Duration::from_secs(5))), None);
        let job_id = scheduler.submit(crew("slow words"), "u").await.unwrap();

        scheduler.shutdown().await;
        let job = tokio::time::timeout(Duration::from_secs(2), scheduler.wait(job_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Cancelled);
    }
}
