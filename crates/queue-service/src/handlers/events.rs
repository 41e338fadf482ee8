//! Live queue events over WebSocket.
//!
//! `GET /api/v1/queues/{queue_id}/events` upgrades to a WebSocket that first
//! carries a `waiting_snapshot` of the queue, then every event published for
//! it, one JSON text frame per event. Messages from the client are ignored;
//! the socket closes when the client leaves or the queue's actor stops.

use crate::broadcast::QueueSubscription;
use crate::errors::QueueError;
use crate::routes::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use common::types::QueueId;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Handler for GET /api/v1/queues/{queue_id}/events
///
/// The subscription is taken before the upgrade, so an unknown queue is a
/// plain 404 rather than a socket that closes immediately.
#[instrument(skip_all, name = "qs.http.events", fields(queue_id = %queue_id))]
pub async fn queue_events(
    State(state): State<Arc<AppState>>,
    Path(queue_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, QueueError> {
    let subscription = state.engine.subscribe(&QueueId::new(queue_id)).await?;
    Ok(ws.on_upgrade(move |socket| forward_events(socket, subscription)))
}

async fn forward_events(mut socket: WebSocket, mut subscription: QueueSubscription) {
    let queue_id = subscription.queue_id().clone();
    debug!(target: "qs.http", queue_id = %queue_id, "Event stream opened");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(target: "qs.http", queue_id = %queue_id, error = %e, "Event serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(target: "qs.http", queue_id = %queue_id, "Event stream closed");
}
