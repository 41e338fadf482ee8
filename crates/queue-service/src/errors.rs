//! Queue service error types.
//!
//! Every engine operation returns [`QueueError`]. The axum glue renders it as
//! `{ "error": { "code", "message" } }` through the `IntoResponse` impl; the
//! message handed to clients never carries backend details, which are logged
//! server-side instead.

use crate::models::{EntryState, Token};
use crate::store::RepositoryError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Queue service error type.
///
/// Maps to HTTP status codes:
/// - `QueueEmpty`, `BadRequest`: 400
/// - `Unauthenticated`: 401
/// - `PermissionDenied`: 403
/// - `QueueNotFound`, `EntryNotFound`: 404
/// - `QueueClosed`, `Conflict`: 409
/// - `CapacityExceeded`: 429
/// - `StaleState`, `Persistence`, `Draining`: 503 (retryable)
/// - `DuplicateToken`, `InvalidTransition`, `Internal`: 500
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue closed: {0}")]
    QueueClosed(String),

    #[error("Queue is empty")]
    QueueEmpty,

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Stale state for entry {entry_id}")]
    StaleState { entry_id: String },

    #[error("Duplicate token {token} in queue {queue_id}")]
    DuplicateToken { queue_id: String, token: Token },

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: EntryState, to: EntryState },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Queue limit reached")]
    CapacityExceeded,

    #[error("Service is draining")]
    Draining,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// HTTP status code for this error (also used as a metric label).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            QueueError::QueueEmpty | QueueError::BadRequest(_) => 400,
            QueueError::Unauthenticated(_) => 401,
            QueueError::PermissionDenied(_) => 403,
            QueueError::QueueNotFound(_) | QueueError::EntryNotFound(_) => 404,
            QueueError::QueueClosed(_) | QueueError::Conflict(_) => 409,
            QueueError::CapacityExceeded => 429,
            QueueError::StaleState { .. } | QueueError::Persistence(_) | QueueError::Draining => 503,
            QueueError::DuplicateToken { .. }
            | QueueError::InvalidTransition { .. }
            | QueueError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            QueueError::QueueNotFound(_) => "QUEUE_NOT_FOUND",
            QueueError::QueueClosed(_) => "QUEUE_CLOSED",
            QueueError::QueueEmpty => "QUEUE_EMPTY",
            QueueError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            QueueError::StaleState { .. } => "STALE_STATE",
            QueueError::DuplicateToken { .. } => "DUPLICATE_TOKEN",
            QueueError::InvalidTransition { .. } => "INVALID_TRANSITION",
            QueueError::Persistence(_) => "PERSISTENCE_UNAVAILABLE",
            QueueError::Unauthenticated(_) => "UNAUTHENTICATED",
            QueueError::PermissionDenied(_) => "PERMISSION_DENIED",
            QueueError::Conflict(_) => "CONFLICT",
            QueueError::BadRequest(_) => "BAD_REQUEST",
            QueueError::CapacityExceeded => "CAPACITY_EXCEEDED",
            QueueError::Draining => "DRAINING",
            QueueError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to clients.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            QueueError::QueueNotFound(id) => format!("Queue {id} not found"),
            QueueError::QueueClosed(_) => "Queue has ended".to_string(),
            QueueError::QueueEmpty => "No one is waiting".to_string(),
            QueueError::EntryNotFound(id) => format!("Entry {id} not found"),
            QueueError::StaleState { .. }
            | QueueError::Persistence(_)
            | QueueError::Draining => "Temporarily unavailable, please retry".to_string(),
            QueueError::Unauthenticated(reason)
            | QueueError::PermissionDenied(reason)
            | QueueError::Conflict(reason)
            | QueueError::BadRequest(reason) => reason.clone(),
            QueueError::CapacityExceeded => "Too many queues, try again later".to_string(),
            QueueError::DuplicateToken { .. }
            | QueueError::InvalidTransition { .. }
            | QueueError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the caller should re-issue the same request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::StaleState { .. } | QueueError::Persistence(_) | QueueError::Draining
        )
    }
}

impl From<RepositoryError> for QueueError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Unavailable(reason) => QueueError::Persistence(reason),
            RepositoryError::Conflict(entry_id) => QueueError::StaleState {
                entry_id: entry_id.to_string(),
            },
            RepositoryError::DuplicateToken { queue_id, token } => QueueError::DuplicateToken {
                queue_id: queue_id.to_string(),
                token,
            },
            RepositoryError::Corrupt(reason) => QueueError::Internal(reason),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        match self.status_code() {
            500 => tracing::error!(target: "qs.http", error = %self, "Request failed"),
            503 => tracing::warn!(target: "qs.http", error = %self, "Request failed, retryable"),
            _ => tracing::debug!(target: "qs.http", error = %self, "Request rejected"),
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code(),
                message: self.client_message(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if self.is_retryable() {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
