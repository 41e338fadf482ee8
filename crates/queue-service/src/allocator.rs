//! Token Allocator.
//!
//! Hands out strictly increasing tokens per queue. The counter is independent
//! of how many entries currently exist: removals never free a token, and two
//! concurrent joins can never read the same value.

use crate::models::Token;
use crate::store::RepositoryError;
use async_trait::async_trait;
use common::types::QueueId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[async_trait]
pub trait TokenAllocator: Send + Sync {
    /// Next token for `queue_id`, strictly greater than any issued before.
    async fn next_token(&self, queue_id: &QueueId) -> Result<Token, RepositoryError>;

    /// Ensure later tokens exceed `issued`. Called when a queue is restored.
    async fn seed(&self, queue_id: &QueueId, issued: Token) -> Result<(), RepositoryError>;
}

/// Per-key atomic counters.
///
/// The map lock is only taken to find or create a queue's counter; the
/// increment itself is a single `fetch_add`.
#[derive(Debug, Default)]
pub struct AtomicTokenAllocator {
    counters: RwLock<HashMap<QueueId, Arc<AtomicU64>>>,
}

impl AtomicTokenAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, queue_id: &QueueId) -> Arc<AtomicU64> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_id)
        {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            counters
                .entry(queue_id.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Highest token issued so far (0 if none).
    #[must_use]
    pub fn last_issued(&self, queue_id: &QueueId) -> Token {
        self.counter(queue_id).load(Ordering::SeqCst)
    }

    pub fn next(&self, queue_id: &QueueId) -> Token {
        self.counter(queue_id).fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl TokenAllocator for AtomicTokenAllocator {
    async fn next_token(&self, queue_id: &QueueId) -> Result<Token, RepositoryError> {
        Ok(self.next(queue_id))
    }

    async fn seed(&self, queue_id: &QueueId, issued: Token) -> Result<(), RepositoryError> {
        self.counter(queue_id).fetch_max(issued, Ordering::SeqCst);
        Ok(())
    }
}
