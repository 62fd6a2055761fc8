//! Thread endpoints and chat turns.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::AppState;
use super::auth::Owner;
use super::error::ApiError;
use crate::threads::{Thread, ThreadSummary};

#[derive(Debug, Deserialize)]
pub(super) struct CreateThreadRequest {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatRequest {
    message: String,
}

fn parse_thread_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("Thread {raw} not found")))
}

/// POST /threads
pub(super) async fn create_thread(
    State(state): State<AppState>,
    owner: Owner,
    Json(body): Json<CreateThreadRequest>,
) -> Response {
    let thread_id = state.threads.create_thread(owner.as_str(), body.name).await;
    (StatusCode::CREATED, Json(json!({ "thread_id": thread_id }))).into_response()
}

/// GET /threads
pub(super) async fn list_threads(
    State(state): State<AppState>,
    owner: Owner,
) -> Json<Vec<ThreadSummary>> {
    Json(state.threads.list_threads(owner.as_str()).await)
}

/// GET /threads/latest
pub(super) async fn latest_thread(
    State(state): State<AppState>,
    owner: Owner,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.threads.get_latest(owner.as_str()).await?))
}

/// GET /threads/{id}
pub(super) async fn get_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<Json<Thread>, ApiError> {
    let thread_id = parse_thread_id(&id)?;
    Ok(Json(state.threads.get(thread_id, owner.as_str()).await?))
}

/// DELETE /threads/{id}
pub(super) async fn delete_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<StatusCode, ApiError> {
    let thread_id = parse_thread_id(&id)?;
    state.threads.delete(thread_id, owner.as_str()).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /threads/{id}/reset
pub(super) async fn reset_thread(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<Json<serde_json::Value>, ApiError> {
    let thread_id = parse_thread_id(&id)?;
    state.threads.reset(thread_id, owner.as_str()).await?;
    Ok(Json(json!({ "status": "reset", "thread_id": thread_id })))
}

/// POST /threads/{id}/chat
pub(super) async fn chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let thread_id = parse_thread_id(&id)?;
    let job_id = state
        .chat
        .submit_turn(thread_id, owner.as_str(), &body.message)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id, "thread_id": thread_id })),
    )
        .into_response())
}
