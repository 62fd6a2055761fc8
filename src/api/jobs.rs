//! Job endpoints: submit, inspect, stream (SSE + WebSocket) and cancel.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use super::auth::Owner;
use super::error::{ApiError, TASK_NOT_FOUND};
use crate::error::StreamError;
use crate::jobs::{CancelOutcome, Job};
use crate::pipeline::JobInput;
use crate::stream::{EventStream, StreamEvent};

/// Crew used by `POST /jobs` when the body names none.
const DEFAULT_CREW: &str = "default";

#[derive(Debug, Deserialize)]
pub(super) struct SubmitJobRequest {
    input: String,
    #[serde(default)]
    crew_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct CrewJobRequest {
    input: String,
}

/// Ids that don't parse can never have been issued.
fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(TASK_NOT_FOUND.to_string()))
}

/// Look up a job and check that `owner` may watch or control it.
async fn owned_job(state: &AppState, raw_id: &str, owner: &Owner) -> Result<Job, ApiError> {
    let job_id = parse_job_id(raw_id)?;
    let job = state.scheduler.get(job_id).await?;
    if job.owner != owner.as_str() {
        return Err(ApiError::Forbidden(format!(
            "Job {job_id} is owned by another principal"
        )));
    }
    Ok(job)
}

async fn submit(state: &AppState, input: JobInput, owner: &Owner) -> Result<Response, ApiError> {
    let job_id = state.scheduler.submit(input, owner.as_str()).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response())
}

/// POST /jobs
pub(super) async fn submit_job(
    State(state): State<AppState>,
    owner: Owner,
    Json(body): Json<SubmitJobRequest>,
) -> Result<Response, ApiError> {
    let input = JobInput::Crew {
        crew_id: body.crew_id.unwrap_or_else(|| DEFAULT_CREW.to_string()),
        input: body.input,
    };
    submit(&state, input, &owner).await
}

/// POST /crews/{crew_id}/jobs
pub(super) async fn submit_crew_job(
    State(state): State<AppState>,
    Path(crew_id): Path<String>,
    owner: Owner,
    Json(body): Json<CrewJobRequest>,
) -> Result<Response, ApiError> {
    let input = JobInput::Crew {
        crew_id,
        input: body.input,
    };
    submit(&state, input, &owner).await
}

/// GET /jobs/{id}
pub(super) async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.scheduler.get(job_id).await?))
}

/// POST /jobs/{id}/cancel
pub(super) async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&id)?;
    let outcome = state.cancel.cancel(job_id, owner.as_str()).await?;

    let status = match outcome {
        CancelOutcome::Signalled | CancelOutcome::AlreadyRequested => StatusCode::ACCEPTED,
        CancelOutcome::AlreadyTerminal(_) => StatusCode::OK,
    };
    Ok((status, Json(json!({ "job_id": job_id, "outcome": outcome }))).into_response())
}

fn sse_event(item: Result<StreamEvent, StreamError>) -> Event {
    match item {
        Ok(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Event::default()
                .event(event.payload.kind())
                .id(event.sequence.to_string())
                .data(data)
        }
        Err(e) => Event::default()
            .event("error")
            .data(json!({ "error": e.to_string() }).to_string()),
    }
}

/// GET /jobs/{id}/stream
pub(super) async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = owned_job(&state, &id, &owner).await?;
    let events = state.scheduler.broker().subscribe(job.id).await?;
    debug!(job_id = %job.id, "SSE subscriber attached");

    let stream = events.map(|item| Ok::<_, Infallible>(sse_event(item)));
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// GET /jobs/{id}/ws
pub(super) async fn ws_job(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    owner: Owner,
) -> Result<Response, ApiError> {
    let job = owned_job(&state, &id, &owner).await?;
    // Subscribe before upgrading so unknown jobs still get a plain 404
    let events = state.scheduler.broker().subscribe(job.id).await?;
    info!(job_id = %job.id, "Job WebSocket client connecting");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, job.id, events)))
}

async fn handle_socket(mut socket: WebSocket, job_id: Uuid, mut events: EventStream) {
    info!(job_id = %job_id, "Job WebSocket client connected");

    loop {
        tokio::select! {
            // Forward job events to this client
            next = events.next() => {
                match next {
                    Some(item) => {
                        let json = match &item {
                            Ok(event) => serde_json::to_string(event),
                            Err(e) => serde_json::to_string(&json!({
                                "type": "error",
                                "error": e.to_string(),
                            })),
                        };
                        if let Ok(json) = json {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!(job_id = %job_id, "Client disconnected during send");
                                break;
                            }
                        }
                    }
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Only control frames are expected from the client
            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(job_id = %job_id, "Job WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %job_id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!(job_id = %job_id, "Job WebSocket connection closed");
}
