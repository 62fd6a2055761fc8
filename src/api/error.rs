//! Mapping from core errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::error::{Error, JobError, StreamError, ThreadError};

/// Client-facing text for unknown or evicted jobs.
pub const TASK_NOT_FOUND: &str = "Task not found";

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Forbidden(String),
    BadRequest(String),
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::TooManyRequests(m) => (StatusCode::TOO_MANY_REQUESTS, m),
            Self::Internal(m) => {
                error!(error = %m, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { .. } => Self::NotFound(TASK_NOT_FOUND.to_string()),
            JobError::Forbidden { .. } => Self::Forbidden(e.to_string()),
            JobError::InvalidInput { .. } => Self::BadRequest(e.to_string()),
            JobError::AtCapacity { .. } => Self::TooManyRequests(e.to_string()),
            JobError::InvalidTransition { .. } | JobError::AlreadyExists { .. } => {
                Self::Conflict(e.to_string())
            }
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::NotFound { .. } => Self::NotFound(TASK_NOT_FOUND.to_string()),
            StreamError::BackpressureDropped { .. } => Self::Internal(e.to_string()),
        }
    }
}

impl From<ThreadError> for ApiError {
    fn from(e: ThreadError) -> Self {
        match e {
            ThreadError::NotFound { .. } | ThreadError::NoThreads { .. } => {
                Self::NotFound(e.to_string())
            }
            ThreadError::Forbidden { .. } => Self::Forbidden(e.to_string()),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Job(e) => e.into(),
            Error::Stream(e) => e.into(),
            Error::Thread(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn unknown_job_maps_to_task_not_found() {
        let err: ApiError = JobError::NotFound { id: Uuid::new_v4() }.into();
        assert!(matches!(err, ApiError::NotFound(ref m) if m == TASK_NOT_FOUND));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn status_codes() {
        let forbidden: ApiError = ThreadError::Forbidden { id: Uuid::nil() }.into();
        assert_eq!(forbidden.into_response().status(), StatusCode::FORBIDDEN);

        let invalid: ApiError = JobError::InvalidInput {
            reason: "empty".into(),
        }
        .into();
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

        let busy: ApiError = Error::Job(JobError::AtCapacity { max: 1 }).into();
        assert_eq!(busy.into_response().status(), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(
            ApiError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
