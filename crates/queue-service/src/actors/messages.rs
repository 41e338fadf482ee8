//! Actor mailbox messages.
//!
//! Every request carries a oneshot `respond_to`. Messages still queued when an
//! actor stops are answered with [`QueueError::Draining`] through `reject`.

use crate::broadcast::QueueSubscription;
use crate::errors::QueueError;
use crate::models::{
    CallNextOutcome, CreateQueueRequest, Entry, JoinOutcome, JoinRequest, QueueRecord, QueueView,
    RemoveOutcome,
};
use common::types::EntryId;
use std::time::Duration;
use tokio::sync::oneshot;

pub type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

/// Messages handled by a `QueueActor`.
#[derive(Debug)]
pub enum QueueMessage {
    Join {
        request: JoinRequest,
        respond_to: Reply<JoinOutcome>,
    },
    CallNext {
        respond_to: Reply<CallNextOutcome>,
    },
    Remove {
        entry_id: EntryId,
        respond_to: Reply<RemoveOutcome>,
    },
    End {
        respond_to: Reply<QueueView>,
    },
    Subscribe {
        respond_to: Reply<QueueSubscription>,
    },
    History {
        respond_to: Reply<Vec<Entry>>,
    },
}

impl QueueMessage {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            QueueMessage::Join { .. } => "join",
            QueueMessage::CallNext { .. } => "call_next",
            QueueMessage::Remove { .. } => "remove",
            QueueMessage::End { .. } => "end",
            QueueMessage::Subscribe { .. } => "subscribe",
            QueueMessage::History { .. } => "history",
        }
    }

    /// Answer without handling.
    pub fn reject(self, err: QueueError) {
        match self {
            QueueMessage::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            QueueMessage::CallNext { respond_to } => {
                let _ = respond_to.send(Err(err));
            }
            QueueMessage::Remove { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            QueueMessage::End { respond_to } => {
                let _ = respond_to.send(Err(err));
            }
            QueueMessage::Subscribe { respond_to } => {
                let _ = respond_to.send(Err(err));
            }
            QueueMessage::History { respond_to } => {
                let _ = respond_to.send(Err(err));
            }
        }
    }
}

/// Messages handled by the `QueueRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    CreateQueue {
        request: CreateQueueRequest,
        respond_to: Reply<QueueRecord>,
    },
    /// Spawn actors for every persisted queue not yet running.
    Restore { respond_to: Reply<usize> },
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    Shutdown {
        deadline: Duration,
        respond_to: Reply<()>,
    },
}

/// Point-in-time registry status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub instance_id: String,
    pub queue_count: usize,
    pub open_queue_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
    pub actor_panics: u64,
}
