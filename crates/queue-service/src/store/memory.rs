//! In-process [`EntryRepository`], used when no redis URL is configured and by
//! the test suites.

use super::repository::{EntryRepository, EntryUpdate, RepositoryError};
use crate::models::{Entry, QueueRecord, Token};
use async_trait::async_trait;
use common::types::{EntryId, QueueId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    queues: HashMap<QueueId, QueueRecord>,
    entries: HashMap<EntryId, Entry>,
    tokens: HashMap<(QueueId, Token), EntryId>,
    join_codes: HashMap<String, QueueId>,
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current stored body of an entry.
    #[must_use]
    pub fn entry(&self, entry_id: &EntryId) -> Option<Entry> {
        self.tables().entries.get(entry_id).cloned()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.tables().entries.len()
    }

    /// Overwrite a stored entry behind the engine's back (tests simulating a
    /// second writer).
    pub fn overwrite_entry(&self, entry: Entry) {
        let mut tables = self.tables();
        tables
            .tokens
            .insert((entry.queue_id.clone(), entry.token), entry.id);
        tables.entries.insert(entry.id, entry);
    }
}

#[async_trait]
impl EntryRepository for InMemoryRepository {
    async fn save_queue(&self, record: &QueueRecord) -> Result<(), RepositoryError> {
        self.tables()
            .queues
            .insert(record.queue_id.clone(), record.clone());
        Ok(())
    }

    async fn load_queues(&self) -> Result<Vec<QueueRecord>, RepositoryError> {
        let mut records: Vec<QueueRecord> = self.tables().queues.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn claim_join_code(
        &self,
        code: &str,
        queue_id: &QueueId,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables();
        match tables.join_codes.get(code) {
            Some(holder) => Ok(holder == queue_id),
            None => {
                tables.join_codes.insert(code.to_string(), queue_id.clone());
                Ok(true)
            }
        }
    }

    async fn insert_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        let mut tables = self.tables();
        let key = (entry.queue_id.clone(), entry.token);

        if let Some(holder) = tables.tokens.get(&key) {
            if *holder == entry.id {
                return Ok(());
            }
            return Err(RepositoryError::DuplicateToken {
                queue_id: entry.queue_id.clone(),
                token: entry.token,
            });
        }

        tables.tokens.insert(key, entry.id);
        tables.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn apply(
        &self,
        queue_id: &QueueId,
        updates: &[EntryUpdate],
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables();

        // Validate the whole batch before touching anything.
        for update in updates {
            let stored = tables
                .entries
                .get(&update.entry.id)
                .filter(|stored| &stored.queue_id == queue_id)
                .ok_or_else(|| {
                    RepositoryError::Corrupt(format!("entry {} not stored", update.entry.id))
                })?;
            if stored.state != update.expected && *stored != update.entry {
                return Err(RepositoryError::Conflict(update.entry.id));
            }
        }

        for update in updates {
            tables.entries.insert(update.entry.id, update.entry.clone());
        }
        Ok(())
    }

    async fn load_entries(&self, queue_id: &QueueId) -> Result<Vec<Entry>, RepositoryError> {
        let mut entries: Vec<Entry> = self
            .tables()
            .entries
            .values()
            .filter(|entry| &entry.queue_id == queue_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.token);
        Ok(entries)
    }
}
