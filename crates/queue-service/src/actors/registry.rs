//! `QueueRegistryActor` - singleton supervisor for queue actors.
//!
//! - Creates queues (clinic or session) and spawns one `QueueActor` each
//! - Restores every persisted queue on start
//! - Hands out session join codes, unique among live queues
//! - Publishes handles into the shared [`QueueDirectory`]
//! - Owns the root `CancellationToken`; queue actors get child tokens
//! - Detects queue actor panics through their `JoinHandle`
//!
//! # Graceful Shutdown
//!
//! 1. Stop accepting new queues
//! 2. Cancel every queue actor (each finishes its queued work, refusing joins)
//! 3. Wait for the actors until the deadline passes
//! 4. Cancel the registry itself

use super::messages::{RegistryMessage, RegistryStatus, Reply};
use super::metrics::{ActorType, MailboxMonitor, RegistryMetrics};
use super::queue::{QueueActor, QueueActorHandle, QueueDeps};
use crate::errors::QueueError;
use crate::models::{CreateQueueRequest, NewQueueKind, QueueKind, QueueRecord, QueueStatus};
use crate::store::{with_retry, QueueStore};
use chrono::Utc;
use common::codes::six_digit_code;
use common::types::QueueId;
use ring::rand::SystemRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// Draws per session before giving up on a unique join code.
const JOIN_CODE_ATTEMPTS: usize = 3;

/// Wait applied when the registry is cancelled without an explicit shutdown.
const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Handle to the `QueueRegistryActor`.
#[derive(Debug, Clone)]
pub struct QueueRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    metrics: Arc<RegistryMetrics>,
}

impl QueueRegistryHandle {
    /// Spawn the registry and return a handle to it.
    #[must_use]
    pub fn new(instance_id: String, max_queues: usize, deps: QueueDeps) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, instance_id.as_str()));
        let metrics = Arc::new(RegistryMetrics::new());

        let actor = QueueRegistryActor {
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            queues: HashMap::new(),
            accepting_new: true,
            max_queues,
            deps,
            metrics: Arc::clone(&metrics),
            mailbox: Arc::clone(&mailbox),
            rng: SystemRandom::new(),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
            metrics,
        }
    }

    pub async fn create_queue(&self, request: CreateQueueRequest) -> Result<QueueRecord, QueueError> {
        self.request(|respond_to| RegistryMessage::CreateQueue {
            request,
            respond_to,
        })
        .await
    }

    /// Spawn actors for persisted queues. Returns how many were started.
    pub async fn restore(&self) -> Result<usize, QueueError> {
        self.request(|respond_to| RegistryMessage::Restore { respond_to })
            .await
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.send(RegistryMessage::GetStatus { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| self.unreachable(format!("response receive failed: {e}")))
    }

    /// Stop accepting queues and wait, up to `deadline`, for every queue actor
    /// to finish.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), QueueError> {
        self.request(|respond_to| RegistryMessage::Shutdown {
            deadline,
            respond_to,
        })
        .await
    }

    /// Cancel the registry (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> RegistryMessage,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await
            .map_err(|e| self.unreachable(format!("response receive failed: {e}")))?
    }

    async fn send(&self, message: RegistryMessage) -> Result<(), QueueError> {
        self.mailbox.record_send();
        self.sender.send(message).await.map_err(|e| {
            self.mailbox.record_unsent();
            self.unreachable(format!("channel send failed: {e}"))
        })
    }

    fn unreachable(&self, detail: String) -> QueueError {
        if self.cancel_token.is_cancelled() {
            QueueError::Draining
        } else {
            QueueError::Internal(detail)
        }
    }
}

struct ManagedQueue {
    handle: QueueActorHandle,
    task_handle: JoinHandle<()>,
}

pub struct QueueRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    queues: HashMap<QueueId, ManagedQueue>,
    accepting_new: bool,
    max_queues: usize,
    deps: QueueDeps,
    metrics: Arc<RegistryMetrics>,
    mailbox: Arc<MailboxMonitor>,
    rng: SystemRandom,
}

impl QueueRegistryActor {
    #[instrument(skip_all, name = "qs.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            max_queues = self.max_queues,
            "QueueRegistryActor started"
        );

        loop {
            self.check_queue_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "qs.actor.registry",
                        instance_id = %self.instance_id,
                        "QueueRegistryActor received cancellation signal"
                    );
                    self.stop_queues(Instant::now() + DEFAULT_DRAIN_DEADLINE).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_handled();
                        }
                        None => {
                            info!(
                                target: "qs.actor.registry",
                                instance_id = %self.instance_id,
                                "QueueRegistryActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            queues_remaining = self.queues.len(),
            messages_processed = self.mailbox.messages_processed(),
            "QueueRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::CreateQueue {
                request,
                respond_to,
            } => {
                let result = self.create_queue(request).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::Restore { respond_to } => {
                let result = self.restore().await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                let result = self.shutdown(deadline).await;
                let _ = respond_to.send(result);
            }
        }
    }

    async fn create_queue(&mut self, request: CreateQueueRequest) -> Result<QueueRecord, QueueError> {
        if !self.accepting_new {
            return Err(QueueError::Draining);
        }
        if self.queues.len() >= self.max_queues {
            warn!(
                target: "qs.actor.registry",
                instance_id = %self.instance_id,
                max_queues = self.max_queues,
                "Refusing new queue, registry at capacity"
            );
            return Err(QueueError::CapacityExceeded);
        }

        let owner_ref = request.owner_ref.trim().to_string();
        if owner_ref.is_empty() {
            return Err(QueueError::BadRequest("owner_ref must not be empty".to_string()));
        }

        let queue_id = match (&request.queue_id, &request.kind) {
            (Some(id), _) => id.clone(),
            (None, NewQueueKind::Clinic) => QueueId::new(owner_ref.clone()),
            (None, NewQueueKind::Session { .. }) => QueueId::generate(),
        };
        if queue_id.as_str().trim().is_empty() {
            return Err(QueueError::BadRequest("queue_id must not be empty".to_string()));
        }
        if self.queues.contains_key(&queue_id) {
            return Err(QueueError::Conflict(format!("queue {queue_id} already exists")));
        }

        let kind = match request.kind {
            NewQueueKind::Clinic => QueueKind::Clinic {
                clinic_ref: owner_ref.clone(),
            },
            NewQueueKind::Session { title, host_name } => {
                let title = title.trim().to_string();
                if title.is_empty() {
                    return Err(QueueError::BadRequest("title must not be empty".to_string()));
                }
                let host_name = host_name
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| owner_ref.clone());
                let join_code = self.claim_join_code(&queue_id).await?;
                QueueKind::Session {
                    title,
                    host_name,
                    join_code,
                }
            }
        };

        let record = QueueRecord {
            queue_id: queue_id.clone(),
            owner_ref,
            kind,
            status: QueueStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
        };

        let repository = &self.deps.repository;
        let pending = &record;
        with_retry(&self.deps.retry, "save_queue", &queue_id, move || {
            repository.save_queue(pending)
        })
        .await?;

        let store = QueueStore::new(queue_id.clone(), Arc::clone(&self.deps.repository), self.deps.retry);
        self.start_queue(record.clone(), store);
        self.metrics.queue_created();

        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            queue_id = %queue_id,
            kind = record.kind.as_str(),
            queue_count = self.queues.len(),
            "Queue created"
        );

        Ok(record)
    }

    async fn claim_join_code(&self, queue_id: &QueueId) -> Result<String, QueueError> {
        for attempt in 1..=JOIN_CODE_ATTEMPTS {
            let code = six_digit_code(&self.rng).map_err(|e| QueueError::Internal(e.to_string()))?;
            if self.deps.directory.contains_join_code(&code) {
                debug!(
                    target: "qs.actor.registry",
                    queue_id = %queue_id,
                    attempt,
                    "Join code already live, drawing another"
                );
                continue;
            }

            let repository = &self.deps.repository;
            let candidate = code.as_str();
            let claimed = with_retry(&self.deps.retry, "claim_join_code", queue_id, move || {
                repository.claim_join_code(candidate, queue_id)
            })
            .await?;
            if claimed {
                return Ok(code);
            }
            debug!(
                target: "qs.actor.registry",
                queue_id = %queue_id,
                attempt,
                "Join code already claimed in persistence, drawing another"
            );
        }

        warn!(
            target: "qs.actor.registry",
            queue_id = %queue_id,
            attempts = JOIN_CODE_ATTEMPTS,
            "Could not allocate a unique join code"
        );
        Err(QueueError::Conflict(
            "could not allocate a unique join code".to_string(),
        ))
    }

    async fn restore(&mut self) -> Result<usize, QueueError> {
        let records = self.deps.repository.load_queues().await?;
        let mut restored = 0;

        for record in records {
            if self.queues.contains_key(&record.queue_id) {
                continue;
            }
            let queue_id = record.queue_id.clone();

            let repository = &self.deps.repository;
            let id = &queue_id;
            let entries = with_retry(&self.deps.retry, "load_entries", &queue_id, move || {
                repository.load_entries(id)
            })
            .await?;

            let store = QueueStore::from_entries(
                queue_id.clone(),
                Arc::clone(&self.deps.repository),
                self.deps.retry,
                entries,
            )
            .map_err(|e| {
                error!(
                    target: "qs.actor.registry",
                    queue_id = %queue_id,
                    error = %e,
                    "Persisted queue failed validation"
                );
                e
            })?;

            if let Some(last) = store.last_token() {
                let allocator = &self.deps.allocator;
                with_retry(&self.deps.retry, "seed", &queue_id, move || {
                    allocator.seed(id, last)
                })
                .await?;
            }

            debug!(
                target: "qs.actor.registry",
                queue_id = %queue_id,
                waiting = store.waiting_len(),
                last_token = store.last_token(),
                "Queue restored"
            );
            self.start_queue(record, store);
            restored += 1;
        }

        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            restored,
            "Restore complete"
        );
        Ok(restored)
    }

    fn start_queue(&mut self, record: QueueRecord, store: QueueStore) {
        let queue_id = record.queue_id.clone();
        let join_code = record.kind.join_code().map(str::to_string);

        let (handle, task_handle) = QueueActor::spawn(
            record,
            store,
            self.deps.clone(),
            self.cancel_token.child_token(),
        );

        if let Some(code) = join_code {
            self.deps.directory.insert_join_code(&code, &queue_id);
        }
        self.deps.directory.insert_queue(handle.clone());
        self.queues.insert(
            queue_id,
            ManagedQueue {
                handle,
                task_handle,
            },
        );
        self.metrics.queue_started();
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            instance_id: self.instance_id.clone(),
            queue_count: self.queues.len(),
            open_queue_count: self.queues.values().filter(|q| q.handle.is_open()).count(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.depth(),
            actor_panics: self.metrics.actor_panics(),
        }
    }

    async fn shutdown(&mut self, deadline: Duration) -> Result<(), QueueError> {
        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            queue_count = self.queues.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.stop_queues(Instant::now() + deadline).await;
        self.cancel_token.cancel();
        Ok(())
    }

    async fn stop_queues(&mut self, deadline: Instant) {
        self.accepting_new = false;

        for (queue_id, managed) in &self.queues {
            debug!(
                target: "qs.actor.registry",
                queue_id = %queue_id,
                "Cancelling queue actor"
            );
            managed.handle.cancel();
        }

        for (queue_id, managed) in self.queues.drain() {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "qs.actor.registry",
                        queue_id = %queue_id,
                        "Queue actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "qs.actor.registry",
                        queue_id = %queue_id,
                        error = ?e,
                        "Queue actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "qs.actor.registry",
                        queue_id = %queue_id,
                        "Queue actor shutdown timed out"
                    );
                }
            }
            self.metrics.queue_stopped();
        }

        info!(
            target: "qs.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    async fn check_queue_health(&mut self) {
        let finished: Vec<QueueId> = self
            .queues
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(queue_id, _)| queue_id.clone())
            .collect();

        for queue_id in finished {
            let Some(managed) = self.queues.remove(&queue_id) else {
                continue;
            };
            self.deps.directory.remove_queue(&queue_id);

            match managed.task_handle.await {
                Ok(()) => {
                    warn!(
                        target: "qs.actor.registry",
                        queue_id = %queue_id,
                        "Queue actor exited unexpectedly"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "qs.actor.registry",
                        queue_id = %queue_id,
                        error = ?join_error,
                        "Queue actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Queue);
                }
                Err(_) => {}
            }
            self.metrics.queue_stopped();
        }
    }
}
