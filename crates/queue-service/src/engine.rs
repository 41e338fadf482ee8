//! Queue Lifecycle Engine facade.
//!
//! [`QueueEngine`] is what the HTTP glue talks to. It checks the caller's
//! role, routes queue ids, entry ids and join codes through the
//! [`QueueDirectory`], and forwards mutations to the owning queue actor.
//! Views are read straight from the actor's `watch` channel.

use crate::actors::{QueueActorHandle, QueueDeps, QueueRegistryHandle, RegistryStatus};
use crate::allocator::{AtomicTokenAllocator, TokenAllocator};
use crate::broadcast::{QueueBroadcaster, QueueSubscription};
use crate::config::{Config, DEFAULT_BROADCAST_CAPACITY, DEFAULT_MAX_QUEUES};
use crate::directory::QueueDirectory;
use crate::errors::QueueError;
use crate::models::{
    CallNextOutcome, CreateQueueRequest, Entry, JoinOutcome, JoinRequest, QueueRecord, QueueView,
    RemoveOutcome,
};
use crate::store::{EntryRepository, InMemoryRepository, RetryPolicy};
use common::identity::CallerRole;
use common::types::{EntryId, QueueId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub instance_id: String,
    pub retry: RetryPolicy,
    pub broadcast_capacity: usize,
    pub max_queues: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            instance_id: "qs-local".to_string(),
            retry: RetryPolicy::default(),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            max_queues: DEFAULT_MAX_QUEUES,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            retry: RetryPolicy::new(config.persist_max_attempts, config.persist_retry_backoff),
            broadcast_capacity: config.broadcast_capacity,
            max_queues: config.max_queues,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEngine {
    registry: QueueRegistryHandle,
    directory: Arc<QueueDirectory>,
    broadcaster: Arc<QueueBroadcaster>,
}

impl QueueEngine {
    /// Start the registry and restore every persisted queue.
    pub async fn start(
        settings: EngineSettings,
        repository: Arc<dyn EntryRepository>,
        allocator: Arc<dyn TokenAllocator>,
    ) -> Result<Self, QueueError> {
        let directory = Arc::new(QueueDirectory::new());
        let broadcaster = Arc::new(QueueBroadcaster::new(settings.broadcast_capacity));
        let deps = QueueDeps {
            repository,
            allocator,
            broadcaster: Arc::clone(&broadcaster),
            directory: Arc::clone(&directory),
            retry: settings.retry,
        };

        let registry = QueueRegistryHandle::new(settings.instance_id.clone(), settings.max_queues, deps);
        let restored = match registry.restore().await {
            Ok(restored) => restored,
            Err(e) => {
                registry.cancel();
                return Err(e);
            }
        };

        info!(
            target: "qs.engine",
            instance_id = %settings.instance_id,
            restored,
            "Queue engine started"
        );

        Ok(Self {
            registry,
            directory,
            broadcaster,
        })
    }

    /// Engine over the in-memory repository and allocator.
    pub async fn in_memory(settings: EngineSettings) -> Result<Self, QueueError> {
        Self::start(
            settings,
            Arc::new(InMemoryRepository::new()),
            Arc::new(AtomicTokenAllocator::new()),
        )
        .await
    }

    pub async fn create_queue(
        &self,
        caller: CallerRole,
        request: CreateQueueRequest,
    ) -> Result<QueueRecord, QueueError> {
        require_operator(caller, "create_queue")?;
        self.registry.create_queue(request).await
    }

    pub async fn join(
        &self,
        caller: CallerRole,
        queue_id: &QueueId,
        request: JoinRequest,
    ) -> Result<JoinOutcome, QueueError> {
        let request = request.validated()?;
        debug!(target: "qs.engine", queue_id = %queue_id, role = %caller, "Join requested");
        self.queue(queue_id)?.join(request).await
    }

    /// Join the session behind a six-digit code.
    pub async fn join_by_code(
        &self,
        caller: CallerRole,
        join_code: &str,
        request: JoinRequest,
    ) -> Result<JoinOutcome, QueueError> {
        let queue_id = self
            .directory
            .resolve_join_code(join_code.trim())
            .ok_or_else(|| QueueError::QueueNotFound(format!("join code {}", join_code.trim())))?;
        self.join(caller, &queue_id, request).await
    }

    pub async fn call_next(
        &self,
        caller: CallerRole,
        queue_id: &QueueId,
    ) -> Result<CallNextOutcome, QueueError> {
        require_operator(caller, "call_next")?;
        self.queue(queue_id)?.call_next().await
    }

    pub async fn remove(
        &self,
        caller: CallerRole,
        entry_id: EntryId,
    ) -> Result<RemoveOutcome, QueueError> {
        require_operator(caller, "remove")?;
        let queue_id = self
            .directory
            .queue_of(&entry_id)
            .ok_or_else(|| QueueError::EntryNotFound(entry_id.to_string()))?;
        self.queue(&queue_id)?.remove(entry_id).await
    }

    pub async fn end_queue(&self, caller: CallerRole, queue_id: &QueueId) -> Result<QueueView, QueueError> {
        require_operator(caller, "end_queue")?;
        self.queue(queue_id)?.end().await
    }

    /// Current state of a queue, as of its last completed mutation.
    pub fn queue_view(&self, queue_id: &QueueId) -> Result<QueueView, QueueError> {
        Ok(self.queue(queue_id)?.view())
    }

    /// Every entry of the queue in token order, terminal ones included.
    pub async fn history(&self, queue_id: &QueueId) -> Result<Vec<Entry>, QueueError> {
        self.queue(queue_id)?.history().await
    }

    pub async fn subscribe(&self, queue_id: &QueueId) -> Result<QueueSubscription, QueueError> {
        self.queue(queue_id)?.subscribe().await
    }

    pub async fn status(&self) -> Result<RegistryStatus, QueueError> {
        self.registry.get_status().await
    }

    #[must_use]
    pub fn subscriber_count(&self, queue_id: &QueueId) -> usize {
        self.broadcaster.subscriber_count(queue_id)
    }

    pub async fn shutdown(&self, deadline: Duration) -> Result<(), QueueError> {
        info!(target: "qs.engine", deadline_secs = deadline.as_secs(), "Queue engine shutting down");
        self.registry.shutdown(deadline).await
    }

    fn queue(&self, queue_id: &QueueId) -> Result<QueueActorHandle, QueueError> {
        self.directory
            .queue(queue_id)
            .ok_or_else(|| QueueError::QueueNotFound(queue_id.to_string()))
    }
}

fn require_operator(caller: CallerRole, operation: &'static str) -> Result<(), QueueError> {
    if caller.can_operate_queues() {
        return Ok(());
    }
    warn!(
        target: "qs.engine",
        role = %caller,
        operation,
        "Operation refused for caller role"
    );
    Err(QueueError::PermissionDenied(format!(
        "{operation} requires a provider or admin role"
    )))
}
