//! Read-side routing index shared by the registry, the queue actors and the
//! engine facade.
//!
//! Only the registry adds or drops queues and join codes; only a queue's own
//! actor registers its entries. Readers never go through an actor mailbox,
//! so looking a queue up never waits behind a slow mutation elsewhere.

use crate::actors::QueueActorHandle;
use common::types::{EntryId, QueueId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct QueueDirectory {
    queues: RwLock<HashMap<QueueId, QueueActorHandle>>,
    join_codes: RwLock<HashMap<String, QueueId>>,
    entries: RwLock<HashMap<EntryId, QueueId>>,
}

impl QueueDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_queue(&self, handle: QueueActorHandle) {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.queue_id().clone(), handle);
    }

    pub fn remove_queue(&self, queue_id: &QueueId) -> Option<QueueActorHandle> {
        let removed = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue_id);
        self.join_codes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, holder| holder != queue_id);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, holder| holder != queue_id);
        removed
    }

    #[must_use]
    pub fn queue(&self, queue_id: &QueueId) -> Option<QueueActorHandle> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_id)
            .cloned()
    }

    #[must_use]
    pub fn contains_queue(&self, queue_id: &QueueId) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(queue_id)
    }

    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn handles(&self) -> Vec<QueueActorHandle> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn insert_join_code(&self, code: &str, queue_id: &QueueId) {
        self.join_codes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.to_string(), queue_id.clone());
    }

    #[must_use]
    pub fn contains_join_code(&self, code: &str) -> bool {
        self.join_codes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(code)
    }

    #[must_use]
    pub fn resolve_join_code(&self, code: &str) -> Option<QueueId> {
        self.join_codes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned()
    }

    pub fn insert_entry(&self, entry_id: EntryId, queue_id: &QueueId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry_id, queue_id.clone());
    }

    pub fn insert_entries(&self, entry_ids: impl IntoIterator<Item = EntryId>, queue_id: &QueueId) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for entry_id in entry_ids {
            entries.insert(entry_id, queue_id.clone());
        }
    }

    /// Queue owning `entry_id`.
    #[must_use]
    pub fn queue_of(&self, entry_id: &EntryId) -> Option<QueueId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entry_id)
            .cloned()
    }
}
