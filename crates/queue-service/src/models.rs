//! Queue domain types.
//!
//! Everything the engine stores, returns or broadcasts lives here. Entries are
//! persisted with their contact detail; the wire views ([`EntryView`],
//! [`QueueView`], [`QueueEvent`]) leave it out because every subscriber of a
//! queue receives them.

use crate::errors::QueueError;
use chrono::{DateTime, Utc};
use common::types::{EntryId, QueueId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position number handed out at join time. Starts at 1 per queue.
pub type Token = u64;

/// Upper bound on display name length after trimming.
pub const MAX_DISPLAY_NAME_LEN: usize = 120;

/// Lifecycle state of a queue entry.
///
/// `Waiting -> Serving -> Completed`, with `Waiting`/`Serving` able to
/// short-circuit to `Removed`. `Completed` and `Removed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    Waiting,
    Serving,
    Completed,
    Removed,
}

impl EntryState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntryState::Waiting => "WAITING",
            EntryState::Serving => "SERVING",
            EntryState::Completed => "COMPLETED",
            EntryState::Removed => "REMOVED",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, EntryState::Completed | EntryState::Removed)
    }

    /// Whether the state machine allows `self -> next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: EntryState) -> bool {
        matches!(
            (self, next),
            (EntryState::Waiting, EntryState::Serving)
                | (EntryState::Serving, EntryState::Completed)
                | (EntryState::Waiting, EntryState::Removed)
                | (EntryState::Serving, EntryState::Removed)
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One person's position in a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub queue_id: QueueId,
    pub token: Token,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub state: EntryState,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Entry {
    /// Build a fresh `Waiting` entry for an already-allocated token.
    #[must_use]
    pub fn waiting(queue_id: QueueId, token: Token, request: &JoinRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: EntryId::new(),
            queue_id,
            token,
            display_name: request.name.clone(),
            contact: request.contact.clone(),
            state: EntryState::Waiting,
            joined_at: now,
            served_at: None,
            finished_at: None,
            idempotency_key: request.idempotency_key.clone(),
        }
    }

    /// Copy of this entry moved to `to`, stamping the matching timestamp.
    #[must_use]
    pub fn advanced(&self, to: EntryState, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.state = to;
        match to {
            EntryState::Serving => next.served_at = Some(at),
            EntryState::Completed | EntryState::Removed => next.finished_at = Some(at),
            EntryState::Waiting => {}
        }
        next
    }

    #[must_use]
    pub fn view(&self) -> EntryView {
        EntryView {
            id: self.id,
            token: self.token,
            display_name: self.display_name.clone(),
            state: self.state,
            joined_at: self.joined_at,
            served_at: self.served_at,
        }
    }
}

/// Public projection of an [`Entry`] (no contact detail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryView {
    pub id: EntryId,
    pub token: Token,
    pub display_name: String,
    pub state: EntryState,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub served_at: Option<DateTime<Utc>>,
}

/// Queue flavor. Both share one lifecycle; only the metadata differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueKind {
    /// Standing queue of a clinic, keyed by the clinic's reference.
    Clinic { clinic_ref: String },
    /// Ad-hoc session joined through a six-digit code.
    Session {
        title: String,
        host_name: String,
        join_code: String,
    },
}

impl QueueKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Clinic { .. } => "clinic",
            QueueKind::Session { .. } => "session",
        }
    }

    #[must_use]
    pub fn join_code(&self) -> Option<&str> {
        match self {
            QueueKind::Clinic { .. } => None,
            QueueKind::Session { join_code, .. } => Some(join_code),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
    Open,
    Closed,
}

impl QueueStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Open => "OPEN",
            QueueStatus::Closed => "CLOSED",
        }
    }
}

/// Persisted queue metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub queue_id: QueueId,
    pub owner_ref: String,
    #[serde(flatten)]
    pub kind: QueueKind,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl QueueRecord {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == QueueStatus::Open
    }
}

/// Body of a join call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    #[serde(default)]
    pub contact: Option<String>,
    /// Client-chosen key making a retried join a no-op.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl JoinRequest {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: None,
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.contact = Some(contact.into());
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Trim fields and reject an empty or oversized name.
    pub fn validated(self) -> Result<Self, QueueError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(QueueError::BadRequest("name must not be empty".to_string()));
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(QueueError::BadRequest(format!(
                "name must be at most {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }

        let contact = self
            .contact
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let idempotency_key = self
            .idempotency_key
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());

        Ok(Self {
            name,
            contact,
            idempotency_key,
        })
    }
}

/// Requested flavor when creating a queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NewQueueKind {
    Clinic,
    Session {
        title: String,
        #[serde(default)]
        host_name: Option<String>,
    },
}

/// Body of a create-queue call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateQueueRequest {
    /// Clinic or host reference owning the queue.
    pub owner_ref: String,
    /// Explicit id for clinic queues (e.g. `clinic_1`); generated when absent.
    #[serde(default)]
    pub queue_id: Option<QueueId>,
    #[serde(flatten)]
    pub kind: NewQueueKind,
}

impl CreateQueueRequest {
    #[must_use]
    pub fn clinic(owner_ref: impl Into<String>) -> Self {
        let owner_ref = owner_ref.into();
        Self {
            queue_id: Some(QueueId::new(owner_ref.clone())),
            owner_ref,
            kind: NewQueueKind::Clinic,
        }
    }

    #[must_use]
    pub fn session(owner_ref: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            owner_ref: owner_ref.into(),
            queue_id: None,
            kind: NewQueueKind::Session {
                title: title.into(),
                host_name: None,
            },
        }
    }
}

/// Read-side projection of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueView {
    pub queue_id: QueueId,
    #[serde(flatten)]
    pub kind: QueueKind,
    pub status: QueueStatus,
    pub waiting: Vec<EntryView>,
    pub serving: Option<EntryView>,
    pub completed_count: usize,
    pub removed_count: usize,
    /// Sequence of the last event published for this queue.
    pub sequence: u64,
}

/// Event fanned out to every subscriber of a queue.
///
/// `sequence` increases by one per published event of the queue, which lets a
/// subscriber drop anything older than a snapshot it already holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Waiting entries in serving order, plus whoever is being served.
    WaitingSnapshot {
        queue_id: QueueId,
        sequence: u64,
        status: QueueStatus,
        entries: Vec<EntryView>,
        serving: Option<EntryView>,
    },
    NowServing {
        queue_id: QueueId,
        sequence: u64,
        entry: EntryView,
    },
}

impl QueueEvent {
    #[must_use]
    pub fn sequence(&self) -> u64 {
        match self {
            QueueEvent::WaitingSnapshot { sequence, .. } | QueueEvent::NowServing { sequence, .. } => {
                *sequence
            }
        }
    }

    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        match self {
            QueueEvent::WaitingSnapshot { queue_id, .. } | QueueEvent::NowServing { queue_id, .. } => {
                queue_id
            }
        }
    }

    /// Metric label for the event kind.
    #[must_use]
    pub const fn kind_label(&self) -> &'static str {
        match self {
            QueueEvent::WaitingSnapshot { .. } => "waiting_snapshot",
            QueueEvent::NowServing { .. } => "now_serving",
        }
    }

    /// Snapshot event rebuilt from a queue view.
    #[must_use]
    pub fn snapshot_of(view: &QueueView) -> Self {
        QueueEvent::WaitingSnapshot {
            queue_id: view.queue_id.clone(),
            sequence: view.sequence,
            status: view.status,
            entries: view.waiting.clone(),
            serving: view.serving.clone(),
        }
    }
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub entry: Entry,
    /// True when an idempotency key matched an earlier join.
    pub replayed: bool,
}

/// Result of a successful call-next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNextOutcome {
    pub serving: Entry,
    pub completed: Option<Entry>,
}

/// Result of a remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveOutcome {
    pub entry: Entry,
    /// False when the entry was already terminal.
    pub changed: bool,
}
