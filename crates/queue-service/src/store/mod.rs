//! Queue Store.
//!
//! [`QueueStore`] is the authoritative ordered collection of one queue's
//! entries. It is owned by that queue's actor, so it needs no locking; every
//! mutation is written through the [`EntryRepository`] first and applied to
//! the in-memory indexes only once the write succeeded.

pub mod lua_scripts;
pub mod memory;
pub mod redis;
pub mod repository;
pub mod retry;

pub use memory::InMemoryRepository;
pub use repository::{EntryRepository, EntryUpdate, RepositoryError};
pub use retry::{with_retry, RetryPolicy};

use crate::errors::QueueError;
use crate::models::{Entry, EntryState, RemoveOutcome, Token};
use chrono::Utc;
use common::types::{EntryId, QueueId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error};

/// A requested compare-and-set state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub entry_id: EntryId,
    pub from: EntryState,
    pub to: EntryState,
}

impl Transition {
    #[must_use]
    pub const fn new(entry_id: EntryId, from: EntryState, to: EntryState) -> Self {
        Self { entry_id, from, to }
    }
}

pub struct QueueStore {
    queue_id: QueueId,
    repository: Arc<dyn EntryRepository>,
    retry: RetryPolicy,
    entries: HashMap<EntryId, Entry>,
    /// Every entry, by token.
    by_token: BTreeMap<Token, EntryId>,
    /// Waiting entries, by token. The first key is the head of the queue.
    waiting: BTreeMap<Token, EntryId>,
    serving: Option<EntryId>,
    by_idempotency_key: HashMap<String, EntryId>,
}

impl std::fmt::Debug for QueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueStore")
            .field("queue_id", &self.queue_id)
            .field("entries", &self.entries.len())
            .field("waiting", &self.waiting.len())
            .field("serving", &self.serving)
            .finish_non_exhaustive()
    }
}

impl QueueStore {
    #[must_use]
    pub fn new(queue_id: QueueId, repository: Arc<dyn EntryRepository>, retry: RetryPolicy) -> Self {
        Self {
            queue_id,
            repository,
            retry,
            entries: HashMap::new(),
            by_token: BTreeMap::new(),
            waiting: BTreeMap::new(),
            serving: None,
            by_idempotency_key: HashMap::new(),
        }
    }

    /// Rebuild a store from persisted entries, re-checking the invariants.
    pub fn from_entries(
        queue_id: QueueId,
        repository: Arc<dyn EntryRepository>,
        retry: RetryPolicy,
        entries: Vec<Entry>,
    ) -> Result<Self, QueueError> {
        let mut store = Self::new(queue_id, repository, retry);
        store.rebuild(entries)?;
        Ok(store)
    }

    fn rebuild(&mut self, entries: Vec<Entry>) -> Result<(), QueueError> {
        self.entries.clear();
        self.by_token.clear();
        self.waiting.clear();
        self.serving = None;
        self.by_idempotency_key.clear();

        for entry in entries {
            if entry.queue_id != self.queue_id {
                return Err(QueueError::Internal(format!(
                    "entry {} belongs to queue {}",
                    entry.id, entry.queue_id
                )));
            }
            if self.by_token.contains_key(&entry.token) {
                error!(
                    target: "qs.store",
                    queue_id = %self.queue_id,
                    token = entry.token,
                    "Duplicate token found while loading queue"
                );
                return Err(QueueError::DuplicateToken {
                    queue_id: self.queue_id.to_string(),
                    token: entry.token,
                });
            }
            if entry.state == EntryState::Serving && self.serving.is_some() {
                return Err(QueueError::Internal(format!(
                    "queue {} has more than one serving entry",
                    self.queue_id
                )));
            }
            self.index(entry);
        }
        Ok(())
    }

    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Add a new `Waiting` entry.
    pub async fn insert(&mut self, entry: Entry) -> Result<Entry, QueueError> {
        if entry.queue_id != self.queue_id || entry.state != EntryState::Waiting {
            return Err(QueueError::Internal(format!(
                "refusing to insert entry {} in state {} into queue {}",
                entry.id, entry.state, self.queue_id
            )));
        }
        if let Some(holder) = self.by_token.get(&entry.token) {
            if *holder != entry.id {
                error!(
                    target: "qs.store",
                    queue_id = %self.queue_id,
                    token = entry.token,
                    "Token already held by another entry"
                );
                return Err(QueueError::DuplicateToken {
                    queue_id: self.queue_id.to_string(),
                    token: entry.token,
                });
            }
        }

        let repository = &self.repository;
        let pending = &entry;
        with_retry(&self.retry, "insert_entry", &self.queue_id, move || {
            repository.insert_entry(pending)
        })
        .await
        .map_err(|e| {
            if matches!(e, RepositoryError::DuplicateToken { .. }) {
                error!(
                    target: "qs.store",
                    queue_id = %self.queue_id,
                    token = entry.token,
                    "Persistence reported duplicate token"
                );
            }
            QueueError::from(e)
        })?;

        debug!(
            target: "qs.store",
            queue_id = %self.queue_id,
            entry_id = %entry.id,
            token = entry.token,
            "Entry inserted"
        );
        self.index(entry.clone());
        Ok(entry)
    }

    /// Waiting entries in serving order. A copy, not a live view.
    #[must_use]
    pub fn waiting_snapshot(&self) -> Vec<Entry> {
        self.waiting
            .values()
            .filter_map(|id| self.entries.get(id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn serving_entry(&self) -> Option<Entry> {
        self.serving.and_then(|id| self.entries.get(&id)).cloned()
    }

    /// Waiting entry with the smallest token.
    #[must_use]
    pub fn head(&self) -> Option<&Entry> {
        self.waiting
            .values()
            .next()
            .and_then(|id| self.entries.get(id))
    }

    #[must_use]
    pub fn get(&self, entry_id: &EntryId) -> Option<&Entry> {
        self.entries.get(entry_id)
    }

    #[must_use]
    pub fn find_by_idempotency_key(&self, key: &str) -> Option<&Entry> {
        self.by_idempotency_key
            .get(key)
            .and_then(|id| self.entries.get(id))
    }

    /// Every entry in token order, terminal ones included.
    #[must_use]
    pub fn history(&self) -> Vec<Entry> {
        self.by_token
            .values()
            .filter_map(|id| self.entries.get(id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    #[must_use]
    pub fn count_in(&self, state: EntryState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }

    #[must_use]
    pub fn last_token(&self) -> Option<Token> {
        self.by_token.keys().next_back().copied()
    }

    /// Single compare-and-set transition.
    pub async fn transition(
        &mut self,
        entry_id: EntryId,
        from: EntryState,
        to: EntryState,
    ) -> Result<Entry, QueueError> {
        self.commit(&[Transition::new(entry_id, from, to)])
            .await?
            .pop()
            .ok_or_else(|| QueueError::Internal("empty commit result".to_string()))
    }

    /// Apply a batch of transitions atomically: either every entry moves and
    /// the batch is durable, or nothing changes.
    ///
    /// Returns the updated entries in the order given.
    pub async fn commit(&mut self, transitions: &[Transition]) -> Result<Vec<Entry>, QueueError> {
        let now = Utc::now();
        let mut updates = Vec::with_capacity(transitions.len());

        for t in transitions {
            let entry = self
                .entries
                .get(&t.entry_id)
                .ok_or_else(|| QueueError::EntryNotFound(t.entry_id.to_string()))?;
            if entry.state != t.from {
                return Err(QueueError::StaleState {
                    entry_id: t.entry_id.to_string(),
                });
            }
            if !t.from.can_transition_to(t.to) {
                return Err(QueueError::InvalidTransition {
                    from: t.from,
                    to: t.to,
                });
            }
            updates.push(EntryUpdate {
                expected: t.from,
                entry: entry.advanced(t.to, now),
            });
        }

        // At most one SERVING entry once the batch lands.
        let leaving = |id: &EntryId| transitions.iter().any(|t| t.entry_id == *id);
        let still_serving = usize::from(self.serving.is_some_and(|id| !leaving(&id)));
        let arriving = transitions
            .iter()
            .filter(|t| t.to == EntryState::Serving)
            .count();
        if still_serving + arriving > 1 {
            return Err(QueueError::Internal(format!(
                "commit would leave queue {} with more than one serving entry",
                self.queue_id
            )));
        }

        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let repository = &self.repository;
        let queue_id = &self.queue_id;
        let batch = &updates;
        with_retry(&self.retry, "apply", &self.queue_id, move || {
            repository.apply(queue_id, batch)
        })
        .await?;

        let applied: Vec<Entry> = updates.into_iter().map(|u| u.entry).collect();
        for entry in &applied {
            debug!(
                target: "qs.store",
                queue_id = %self.queue_id,
                entry_id = %entry.id,
                token = entry.token,
                state = %entry.state,
                "Entry transitioned"
            );
            self.index(entry.clone());
        }
        Ok(applied)
    }

    /// Move an entry to `Removed`. A terminal entry is left as is.
    pub async fn remove(&mut self, entry_id: EntryId) -> Result<RemoveOutcome, QueueError> {
        let entry = self
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| QueueError::EntryNotFound(entry_id.to_string()))?;

        if entry.state.is_terminal() {
            return Ok(RemoveOutcome {
                entry,
                changed: false,
            });
        }

        let entry = self
            .transition(entry_id, entry.state, EntryState::Removed)
            .await?;
        Ok(RemoveOutcome {
            entry,
            changed: true,
        })
    }

    /// Discard in-memory state and reload the queue from persistence.
    pub async fn reload(&mut self) -> Result<(), QueueError> {
        let repository = &self.repository;
        let queue_id = &self.queue_id;
        let entries = with_retry(&self.retry, "load_entries", &self.queue_id, move || {
            repository.load_entries(queue_id)
        })
        .await?;

        debug!(
            target: "qs.store",
            queue_id = %self.queue_id,
            entries = entries.len(),
            "Queue reloaded from persistence"
        );
        self.rebuild(entries)
    }

    fn index(&mut self, entry: Entry) {
        let id = entry.id;

        self.waiting.remove(&entry.token);
        if self.serving == Some(id) {
            self.serving = None;
        }
        match entry.state {
            EntryState::Waiting => {
                self.waiting.insert(entry.token, id);
            }
            EntryState::Serving => self.serving = Some(id),
            EntryState::Completed | EntryState::Removed => {}
        }

        if let Some(key) = &entry.idempotency_key {
            self.by_idempotency_key.insert(key.clone(), id);
        }
        self.by_token.insert(entry.token, id);
        self.entries.insert(id, entry);
    }
}
