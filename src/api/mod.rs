//! HTTP surface for jobs and threads.
//!
//! - `auth` — bearer-principal extractor
//! - `error` — ApiError and its status mapping
//! - `jobs` — submit/get/cancel plus SSE and WebSocket streams
//! - `threads` — thread CRUD and chat turns

pub mod auth;
pub mod error;
mod jobs;
mod threads;

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

pub use auth::Owner;
pub use error::{ApiError, TASK_NOT_FOUND};

use crate::chat::ChatService;
use crate::config::RuntimeConfig;
use crate::jobs::{CancellationController, JobStore, Scheduler, SchedulerConfig};
use crate::pipeline::ExecutionPipeline;
use crate::stream::StreamBroker;
use crate::threads::ThreadManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub cancel: Arc<CancellationController>,
    pub threads: Arc<ThreadManager>,
    pub chat: Arc<ChatService>,
}

impl AppState {
    /// Wire up the job core around `pipeline`.
    pub fn new(config: &RuntimeConfig, pipeline: Arc<dyn ExecutionPipeline>) -> Self {
        let store = Arc::new(JobStore::new(config.max_active_jobs));
        let broker = Arc::new(StreamBroker::new(config.stream_capacity));
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from(config),
            pipeline,
            Arc::clone(&store),
            broker,
        ));
        let threads = Arc::new(ThreadManager::with_system_prompt(
            config.system_prompt.clone(),
        ));
        let chat = Arc::new(ChatService::new(
            Arc::clone(&threads),
            Arc::clone(&scheduler),
            config.history_policy,
        ));

        Self {
            scheduler,
            cancel: Arc::new(CancellationController::new(store)),
            threads,
            chat,
        }
    }
}

/// Build the Axum router with job and thread routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", post(jobs::submit_job))
        .route("/crews/{crew_id}/jobs", post(jobs::submit_crew_job))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/stream", get(jobs::stream_job))
        .route("/jobs/{id}/ws", get(jobs::ws_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route(
            "/threads",
            post(threads::create_thread).get(threads::list_threads),
        )
        .route("/threads/latest", get(threads::latest_thread))
        .route(
            "/threads/{id}",
            get(threads::get_thread).delete(threads::delete_thread),
        )
        .route("/threads/{id}/reset", post(threads::reset_thread))
        .route("/threads/{id}/chat", post(threads::chat))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crew-runner"
    }))
}
