//! Repository double with injectable failures.
//!
//! Wraps [`InMemoryRepository`] and fails the next N calls of an operation
//! with `Unavailable`, or the next N `apply` batches with `Conflict`.
//! Failed calls never reach the inner repository.
//!
//! # Example
//!
//! ```rust,ignore
//! use queue_test_utils::FaultyRepository;
//!
//! let repository = Arc::new(FaultyRepository::new());
//! repository.fail_next_inserts(2);
//!
//! // A join still succeeds: the engine retries with the same token.
//! let joined = engine.join(CallerRole::Patient, &queue, JoinRequest::new("Ann")).await?;
//! assert_eq!(repository.insert_calls(), 3);
//! ```

use async_trait::async_trait;
use common::types::QueueId;
use queue_service::models::{Entry, QueueRecord};
use queue_service::store::{EntryRepository, EntryUpdate, InMemoryRepository, RepositoryError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct FaultyRepository {
    inner: InMemoryRepository,
    failing_inserts: AtomicU32,
    failing_applies: AtomicU32,
    failing_saves: AtomicU32,
    failing_loads: AtomicU32,
    conflicting_applies: AtomicU32,
    offline: AtomicBool,
    insert_calls: AtomicU32,
    apply_calls: AtomicU32,
}

impl FaultyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backing store, for assertions and out-of-band writes.
    pub fn inner(&self) -> &InMemoryRepository {
        &self.inner
    }

    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_applies(&self, count: u32) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_entry_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` apply batches as if another writer got there
    /// first.
    pub fn conflict_next_applies(&self, count: u32) {
        self.conflicting_applies.store(count, Ordering::SeqCst);
    }

    /// Every call fails with `Unavailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `insert_entry` calls seen, failed ones included.
    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of `apply` calls seen, failed ones included.
    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn check(&self, budget: &AtomicU32, operation: &str) -> Result<(), RepositoryError> {
        if self.offline.load(Ordering::SeqCst) || take_one(budget) {
            return Err(RepositoryError::Unavailable(format!(
                "injected {operation} failure"
            )));
        }
        Ok(())
    }
}

/// Consume one unit of a failure budget. `false` once it is spent.
fn take_one(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl EntryRepository for FaultyRepository {
    async fn save_queue(&self, record: &QueueRecord) -> Result<(), RepositoryError> {
        self.check(&self.failing_saves, "save_queue")?;
        self.inner.save_queue(record).await
    }

    async fn load_queues(&self) -> Result<Vec<QueueRecord>, RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "injected load_queues failure".to_string(),
            ));
        }
        self.inner.load_queues().await
    }

    async fn claim_join_code(
        &self,
        code: &str,
        queue_id: &QueueId,
    ) -> Result<bool, RepositoryError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable(
                "injected claim_join_code failure".to_string(),
            ));
        }
        self.inner.claim_join_code(code, queue_id).await
    }

    async fn insert_entry(&self, entry: &Entry) -> Result<(), RepositoryError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&self.failing_inserts, "insert_entry")?;
        self.inner.insert_entry(entry).await
    }

    async fn apply(
        &self,
        queue_id: &QueueId,
        updates: &[EntryUpdate],
    ) -> Result<(), RepositoryError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.check(&self.failing_applies, "apply")?;
        if take_one(&self.conflicting_applies) {
            if let Some(update) = updates.first() {
                return Err(RepositoryError::Conflict(update.entry.id));
            }
        }
        self.inner.apply(queue_id, updates).await
    }

    async fn load_entries(&self, queue_id: &QueueId) -> Result<Vec<Entry>, RepositoryError> {
        self.check(&self.failing_loads, "load_entries")?;
        self.inner.load_entries(queue_id).await
    }
}
