//! Queue handlers.
//!
//! - `POST /api/v1/queues` - Create a clinic queue or session (staff)
//! - `POST /api/v1/queues/{queue_id}/join` - Join a queue
//! - `POST /api/v1/sessions/join` - Join a session by its six-digit code
//! - `POST /api/v1/queues/{queue_id}/call-next` - Serve the next entry (staff)
//! - `DELETE /api/v1/entries/{entry_id}` - Remove an entry (staff)
//! - `POST /api/v1/queues/{queue_id}/end` - Close a queue to new joins (staff)
//! - `GET /api/v1/queues/{queue_id}` - Current view (public)
//! - `GET /api/v1/queues/{queue_id}/history` - Every entry in token order
//!
//! Bodies are parsed by hand so malformed JSON surfaces as the service's own
//! `BAD_REQUEST` error shape.

use crate::errors::QueueError;
use crate::middleware::Caller;
use crate::models::{
    CallNextOutcome, CreateQueueRequest, Entry, EntryView, JoinOutcome, JoinRequest, QueueRecord,
    QueueView,
};
use crate::routes::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use common::types::{EntryId, QueueId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// Response for a join.
#[derive(Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    pub queue_id: QueueId,
    pub entry: EntryView,
    /// Waiting entries ahead of this one at the time of the join.
    pub ahead: usize,
    pub replayed: bool,
}

/// Body of `POST /api/v1/sessions/join`.
#[derive(Debug, Deserialize)]
pub struct JoinByCodeRequest {
    pub join_code: String,
    #[serde(flatten)]
    pub request: JoinRequest,
}

/// Response for call-next. Staff see full entries, contact included.
#[derive(Debug, Serialize, Deserialize)]
pub struct CallNextResponse {
    pub serving: Entry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<Entry>,
}

impl From<CallNextOutcome> for CallNextResponse {
    fn from(outcome: CallNextOutcome) -> Self {
        Self {
            serving: outcome.serving,
            completed: outcome.completed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub entry: Entry,
    pub changed: bool,
}

/// History as seen by the caller: staff get full entries, patients views.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum HistoryResponse {
    Full { entries: Vec<Entry> },
    Public { entries: Vec<EntryView> },
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, QueueError> {
    serde_json::from_slice(body).map_err(|e| QueueError::BadRequest(format!("invalid request body: {e}")))
}

fn parse_entry_id(raw: &str) -> Result<EntryId, QueueError> {
    raw.parse()
        .map_err(|_| QueueError::BadRequest(format!("invalid entry id: {raw}")))
}

/// Handler for POST /api/v1/queues
#[instrument(skip_all, name = "qs.http.create_queue")]
pub async fn create_queue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<(StatusCode, Json<QueueRecord>), QueueError> {
    let request: CreateQueueRequest = parse_body(&body)?;
    let record = state.engine.create_queue(caller.role, request).await?;

    info!(
        target: "qs.http",
        queue_id = %record.queue_id,
        kind = record.kind.as_str(),
        "Queue created"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

/// Handler for POST /api/v1/queues/{queue_id}/join
///
/// 201 for a new entry, 200 when an idempotency key replays an earlier join.
#[instrument(skip_all, name = "qs.http.join", fields(queue_id = %queue_id))]
pub async fn join_queue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(queue_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<JoinResponse>), QueueError> {
    let request: JoinRequest = parse_body(&body)?;
    let queue_id = QueueId::new(queue_id);
    let outcome = state.engine.join(caller.role, &queue_id, request).await?;
    join_response(&state, queue_id, outcome)
}

/// Handler for POST /api/v1/sessions/join
#[instrument(skip_all, name = "qs.http.join_by_code")]
pub async fn join_by_code(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> Result<(StatusCode, Json<JoinResponse>), QueueError> {
    let JoinByCodeRequest { join_code, request } = parse_body(&body)?;
    let outcome = state
        .engine
        .join_by_code(caller.role, &join_code, request)
        .await?;
    let queue_id = outcome.entry.queue_id.clone();
    join_response(&state, queue_id, outcome)
}

fn join_response(
    state: &AppState,
    queue_id: QueueId,
    outcome: JoinOutcome,
) -> Result<(StatusCode, Json<JoinResponse>), QueueError> {
    let ahead = state
        .engine
        .queue_view(&queue_id)?
        .waiting
        .iter()
        .take_while(|e| e.token < outcome.entry.token)
        .count();
    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(JoinResponse {
            queue_id,
            entry: outcome.entry.view(),
            ahead,
            replayed: outcome.replayed,
        }),
    ))
}

/// Handler for POST /api/v1/queues/{queue_id}/call-next
///
/// 400 `QUEUE_EMPTY` when nobody is waiting.
#[instrument(skip_all, name = "qs.http.call_next", fields(queue_id = %queue_id))]
pub async fn call_next(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(queue_id): Path<String>,
) -> Result<Json<CallNextResponse>, QueueError> {
    let outcome = state
        .engine
        .call_next(caller.role, &QueueId::new(queue_id))
        .await?;
    Ok(Json(outcome.into()))
}

/// Handler for DELETE /api/v1/entries/{entry_id}
#[instrument(skip_all, name = "qs.http.remove", fields(entry_id = %entry_id))]
pub async fn remove_entry(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(entry_id): Path<String>,
) -> Result<Json<RemoveResponse>, QueueError> {
    let entry_id = parse_entry_id(&entry_id)?;
    let outcome = state.engine.remove(caller.role, entry_id).await?;
    Ok(Json(RemoveResponse {
        entry: outcome.entry,
        changed: outcome.changed,
    }))
}

/// Handler for POST /api/v1/queues/{queue_id}/end
#[instrument(skip_all, name = "qs.http.end_queue", fields(queue_id = %queue_id))]
pub async fn end_queue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(queue_id): Path<String>,
) -> Result<Json<QueueView>, QueueError> {
    let view = state
        .engine
        .end_queue(caller.role, &QueueId::new(queue_id))
        .await?;
    Ok(Json(view))
}

/// Handler for GET /api/v1/queues/{queue_id}
pub async fn get_queue(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
) -> Result<Json<QueueView>, QueueError> {
    Ok(Json(state.engine.queue_view(&QueueId::new(queue_id))?))
}

/// Handler for GET /api/v1/queues/{queue_id}/history
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(queue_id): Path<String>,
) -> Result<Json<HistoryResponse>, QueueError> {
    let entries = state.engine.history(&QueueId::new(queue_id)).await?;
    let response = if caller.role.can_operate_queues() {
        HistoryResponse::Full { entries }
    } else {
        HistoryResponse::Public {
            entries: entries.iter().map(Entry::view).collect(),
        }
    };
    Ok(Json(response))
}
