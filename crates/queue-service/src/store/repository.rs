//! Persistence Service contract.
//!
//! The [`QueueStore`](super::QueueStore) writes through to an
//! [`EntryRepository`] before it changes its in-memory view, so an entry the
//! engine has acknowledged or broadcast is always durable.

use crate::models::{Entry, EntryState, QueueRecord, Token};
use async_trait::async_trait;
use common::types::{EntryId, QueueId};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    /// Backend unreachable or timed out. Safe to retry with the same payload.
    #[error("Persistence backend unavailable: {0}")]
    Unavailable(String),

    /// Stored state did not match the expected prior state.
    #[error("State conflict on entry {0}")]
    Conflict(EntryId),

    #[error("Duplicate token {token} in queue {queue_id}")]
    DuplicateToken { queue_id: QueueId, token: Token },

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl RepositoryError {
    /// Only transport-level failures are retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

/// One compare-and-set write inside an [`EntryRepository::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryUpdate {
    /// State the stored entry must be in for the write to apply.
    pub expected: EntryState,
    /// Full new body of the entry.
    pub entry: Entry,
}

#[async_trait]
pub trait EntryRepository: Send + Sync {
    /// Upsert queue metadata.
    async fn save_queue(&self, record: &QueueRecord) -> Result<(), RepositoryError>;

    async fn load_queues(&self) -> Result<Vec<QueueRecord>, RepositoryError>;

    /// Reserve a session join code. Returns `false` if another queue holds it.
    async fn claim_join_code(&self, code: &str, queue_id: &QueueId)
        -> Result<bool, RepositoryError>;

    /// Store a new entry.
    ///
    /// Fails with `DuplicateToken` if another entry already holds
    /// `(queue_id, token)`. Re-inserting the same entry id is a success.
    async fn insert_entry(&self, entry: &Entry) -> Result<(), RepositoryError>;

    /// Apply every update or none.
    ///
    /// An update whose stored body already equals the new body counts as
    /// applied, so a batch interrupted after the write can be replayed. Any
    /// other state mismatch fails the whole batch with `Conflict`.
    async fn apply(&self, queue_id: &QueueId, updates: &[EntryUpdate])
        -> Result<(), RepositoryError>;

    /// All entries of a queue, any state, ascending by token.
    async fn load_entries(&self, queue_id: &QueueId) -> Result<Vec<Entry>, RepositoryError>;
}
