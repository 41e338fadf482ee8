//! `QueueActor` - one task per queue, owning that queue's [`QueueStore`].
//!
//! Every mutation of a queue (join, call-next, remove, end) runs inside its
//! actor, one message at a time, so the read-select-transition sequence of
//! call-next can never interleave with another mutation of the same queue.
//! Different queues run on different tasks and never wait on each other.
//!
//! After each committed mutation the actor refreshes a `watch` view (read
//! side for the engine) and then publishes to the queue's broadcast channel.
//! Event sequences are assigned here, which gives subscribers one total
//! order per queue.

use super::messages::{QueueMessage, Reply};
use super::metrics::{ActorType, MailboxMonitor};
use crate::allocator::TokenAllocator;
use crate::broadcast::{QueueBroadcaster, QueueSubscription};
use crate::directory::QueueDirectory;
use crate::errors::QueueError;
use crate::models::{
    CallNextOutcome, Entry, EntryState, JoinOutcome, JoinRequest, QueueEvent, QueueRecord,
    QueueStatus, QueueView, RemoveOutcome,
};
use crate::observability::metrics;
use crate::store::{with_retry, EntryRepository, QueueStore, RetryPolicy, Transition};
use chrono::Utc;
use common::types::{EntryId, QueueId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Mailbox size per queue.
const QUEUE_CHANNEL_BUFFER: usize = 256;

/// Allocated-but-unpersisted joins kept for an idempotent retry.
const MAX_PENDING_JOINS: usize = 1024;

/// Shared collaborators handed to every queue actor.
#[derive(Clone)]
pub struct QueueDeps {
    pub repository: Arc<dyn EntryRepository>,
    pub allocator: Arc<dyn TokenAllocator>,
    pub broadcaster: Arc<QueueBroadcaster>,
    pub directory: Arc<QueueDirectory>,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for QueueDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDeps")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Handle to a `QueueActor`.
#[derive(Debug, Clone)]
pub struct QueueActorHandle {
    queue_id: QueueId,
    sender: mpsc::Sender<QueueMessage>,
    view: watch::Receiver<QueueView>,
    mailbox: Arc<MailboxMonitor>,
    cancel_token: CancellationToken,
}

impl QueueActorHandle {
    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// State as of the last completed mutation. Never waits on the mailbox.
    #[must_use]
    pub fn view(&self) -> QueueView {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.view.borrow().status == QueueStatus::Open
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, QueueError> {
        self.request(|respond_to| QueueMessage::Join {
            request,
            respond_to,
        })
        .await
    }

    pub async fn call_next(&self) -> Result<CallNextOutcome, QueueError> {
        self.request(|respond_to| QueueMessage::CallNext { respond_to })
            .await
    }

    pub async fn remove(&self, entry_id: EntryId) -> Result<RemoveOutcome, QueueError> {
        self.request(|respond_to| QueueMessage::Remove {
            entry_id,
            respond_to,
        })
        .await
    }

    /// Close the queue to new joins. Returns the resulting view.
    pub async fn end(&self) -> Result<QueueView, QueueError> {
        self.request(|respond_to| QueueMessage::End { respond_to })
            .await
    }

    pub async fn subscribe(&self) -> Result<QueueSubscription, QueueError> {
        self.request(|respond_to| QueueMessage::Subscribe { respond_to })
            .await
    }

    pub async fn history(&self) -> Result<Vec<Entry>, QueueError> {
        self.request(|respond_to| QueueMessage::History { respond_to })
            .await
    }

    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.depth()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> QueueMessage,
    ) -> Result<T, QueueError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_send();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.record_unsent();
            return Err(self.unreachable(format!("channel send failed: {e}")));
        }

        rx.await
            .map_err(|e| self.unreachable(format!("response receive failed: {e}")))?
    }

    fn unreachable(&self, detail: String) -> QueueError {
        if self.cancel_token.is_cancelled() {
            QueueError::Draining
        } else {
            QueueError::Internal(detail)
        }
    }
}

pub struct QueueActor {
    queue_id: QueueId,
    record: QueueRecord,
    store: QueueStore,
    receiver: mpsc::Receiver<QueueMessage>,
    cancel_token: CancellationToken,
    view_tx: watch::Sender<QueueView>,
    /// Sequence of the last published event.
    sequence: u64,
    /// Joins whose token was allocated but whose insert failed transiently,
    /// keyed by idempotency key.
    pending_joins: HashMap<String, Entry>,
    deps: QueueDeps,
    mailbox: Arc<MailboxMonitor>,
}

impl QueueActor {
    /// Spawn the actor for `record`, taking ownership of its loaded store.
    pub fn spawn(
        record: QueueRecord,
        store: QueueStore,
        deps: QueueDeps,
        cancel_token: CancellationToken,
    ) -> (QueueActorHandle, JoinHandle<()>) {
        let queue_id = record.queue_id.clone();
        let (sender, receiver) = mpsc::channel(QUEUE_CHANNEL_BUFFER);
        let (view_tx, view_rx) = watch::channel(build_view(&record, &store, 0));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Queue, queue_id.as_str()));

        deps.directory
            .insert_entries(store.history().iter().map(|e| e.id), &queue_id);

        let actor = Self {
            queue_id: queue_id.clone(),
            record,
            store,
            receiver,
            cancel_token: cancel_token.clone(),
            view_tx,
            sequence: 0,
            pending_joins: HashMap::new(),
            deps,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = QueueActorHandle {
            queue_id,
            sender,
            view: view_rx,
            mailbox,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "qs.actor.queue", fields(queue_id = %self.queue_id))]
    async fn run(mut self) {
        info!(
            target: "qs.actor.queue",
            queue_id = %self.queue_id,
            kind = self.record.kind.as_str(),
            status = self.record.status.as_str(),
            waiting = self.store.waiting_len(),
            "QueueActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "qs.actor.queue",
                        queue_id = %self.queue_id,
                        "QueueActor received cancellation signal"
                    );
                    self.drain().await;
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
                                target: "qs.actor.queue",
                                queue_id = %self.queue_id,
                                "QueueActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.deps.broadcaster.close(&self.queue_id);

        info!(
            target: "qs.actor.queue",
            queue_id = %self.queue_id,
            waiting = self.store.waiting_len(),
            messages_processed = self.mailbox.messages_processed(),
            "QueueActor stopped"
        );
    }

    /// Finish what is already queued, refusing new joins.
    async fn drain(&mut self) {
        self.receiver.close();
        let mut drained = 0usize;
        while let Some(message) = self.receiver.recv().await {
            if matches!(message, QueueMessage::Join { .. }) {
                message.reject(QueueError::Draining);
            } else {
                self.handle_message(message).await;
            }
            self.mailbox.record_handled();
            drained += 1;
        }
        if drained > 0 {
            debug!(
                target: "qs.actor.queue",
                queue_id = %self.queue_id,
                drained,
                "Drained queued messages before stopping"
            );
        }
    }

    async fn handle_message(&mut self, message: QueueMessage) {
        match message {
            QueueMessage::Join {
                request,
                respond_to,
            } => {
                let result = self.handle_join(request).await;
                metrics::record_join(metrics::outcome_label(&result));
                let _ = respond_to.send(result);
            }

            QueueMessage::CallNext { respond_to } => {
                let started = Instant::now();
                let result = self.handle_call_next().await;
                metrics::record_call_next(metrics::outcome_label(&result), started.elapsed());
                let _ = respond_to.send(result);
            }

            QueueMessage::Remove {
                entry_id,
                respond_to,
            } => {
                let result = self.handle_remove(entry_id).await;
                metrics::record_removal(metrics::outcome_label(&result));
                let _ = respond_to.send(result);
            }

            QueueMessage::End { respond_to } => {
                let _ = respond_to.send(self.handle_end().await);
            }

            QueueMessage::Subscribe { respond_to } => {
                let _ = respond_to.send(Ok(self.handle_subscribe()));
            }

            QueueMessage::History { respond_to } => {
                let _ = respond_to.send(Ok(self.store.history()));
            }
        }
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<JoinOutcome, QueueError> {
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_by_idempotency_key(key) {
                debug!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    entry_id = %existing.id,
                    token = existing.token,
                    "Join replayed for known idempotency key"
                );
                return Ok(JoinOutcome {
                    entry: existing.clone(),
                    replayed: true,
                });
            }
        }

        if !self.record.is_open() {
            return Err(QueueError::QueueClosed(self.queue_id.to_string()));
        }

        let pending = request
            .idempotency_key
            .as_deref()
            .and_then(|key| self.pending_joins.remove(key));
        let entry = match pending {
            Some(entry) => {
                debug!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    token = entry.token,
                    "Resuming join with previously allocated token"
                );
                entry
            }
            None => {
                // One draw per join: a retried draw may have already counted.
                let token = self
                    .deps
                    .allocator
                    .next_token(&self.queue_id)
                    .await
                    .map_err(|err| {
                        warn!(
                            target: "qs.actor.queue",
                            queue_id = %self.queue_id,
                            error = %err,
                            "Token allocation failed"
                        );
                        QueueError::from(err)
                    })?;
                Entry::waiting(self.queue_id.clone(), token, &request, Utc::now())
            }
        };

        match self.store.insert(entry.clone()).await {
            Ok(entry) => {
                self.deps.directory.insert_entry(entry.id, &self.queue_id);
                info!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    entry_id = %entry.id,
                    token = entry.token,
                    "Entry joined"
                );
                self.publish(None);
                Ok(JoinOutcome {
                    entry,
                    replayed: false,
                })
            }
            Err(err) => {
                warn!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    token = entry.token,
                    error = %err,
                    "Join failed to persist"
                );
                if err.is_retryable() && self.pending_joins.len() < MAX_PENDING_JOINS {
                    if let Some(key) = entry.idempotency_key.clone() {
                        self.pending_joins.insert(key, entry);
                    }
                }
                Err(err)
            }
        }
    }

    async fn handle_call_next(&mut self) -> Result<CallNextOutcome, QueueError> {
        match self.advance().await {
            Err(QueueError::StaleState { entry_id }) => {
                warn!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    entry_id = %entry_id,
                    "Call-next saw stale state, reloading and retrying once"
                );
                self.resync().await?;
                self.advance().await
            }
            other => other,
        }
    }

    /// Complete whoever is serving and move the head of the line to serving,
    /// as one atomic commit.
    async fn advance(&mut self) -> Result<CallNextOutcome, QueueError> {
        let mut transitions = Vec::with_capacity(2);
        if let Some(current) = self.store.serving_entry() {
            transitions.push(Transition::new(
                current.id,
                EntryState::Serving,
                EntryState::Completed,
            ));
        }

        let Some(head) = self.store.head().map(|e| e.id) else {
            if !transitions.is_empty() {
                self.store.commit(&transitions).await?;
            }
            // Watchers get the (now empty) line even when nothing moved.
            self.publish(None);
            return Err(QueueError::QueueEmpty);
        };
        transitions.push(Transition::new(head, EntryState::Waiting, EntryState::Serving));

        let mut applied = self.store.commit(&transitions).await?;
        let serving = applied
            .pop()
            .ok_or_else(|| QueueError::Internal("call-next commit returned nothing".to_string()))?;
        let completed = applied.pop();

        info!(
            target: "qs.actor.queue",
            queue_id = %self.queue_id,
            entry_id = %serving.id,
            token = serving.token,
            completed_token = completed.as_ref().map(|e| e.token),
            "Now serving"
        );
        self.publish(Some(&serving));

        Ok(CallNextOutcome { serving, completed })
    }

    async fn handle_remove(&mut self, entry_id: EntryId) -> Result<RemoveOutcome, QueueError> {
        let outcome = match self.store.remove(entry_id).await {
            Err(QueueError::StaleState { .. }) => {
                warn!(
                    target: "qs.actor.queue",
                    queue_id = %self.queue_id,
                    entry_id = %entry_id,
                    "Remove saw stale state, reloading and retrying once"
                );
                self.resync().await?;
                self.store.remove(entry_id).await?
            }
            other => other?,
        };

        if outcome.changed {
            info!(
                target: "qs.actor.queue",
                queue_id = %self.queue_id,
                entry_id = %entry_id,
                token = outcome.entry.token,
                "Entry removed"
            );
        }
        self.publish(None);
        Ok(outcome)
    }

    async fn handle_end(&mut self) -> Result<QueueView, QueueError> {
        if self.record.is_open() {
            let mut closed = self.record.clone();
            closed.status = QueueStatus::Closed;
            closed.closed_at = Some(Utc::now());

            let repository = &self.deps.repository;
            let pending = &closed;
            with_retry(&self.deps.retry, "save_queue", &self.queue_id, move || {
                repository.save_queue(pending)
            })
            .await?;

            self.record = closed;
            info!(
                target: "qs.actor.queue",
                queue_id = %self.queue_id,
                waiting = self.store.waiting_len(),
                "Queue closed to new joins"
            );
            self.publish(None);
        }
        Ok(self.view_tx.borrow().clone())
    }

    /// The receiver is created here, between two messages, so no event can
    /// fall between the initial snapshot and the live stream.
    fn handle_subscribe(&self) -> QueueSubscription {
        let receiver = self.deps.broadcaster.subscribe(&self.queue_id);
        let initial = QueueEvent::snapshot_of(&self.view_tx.borrow());
        QueueSubscription::new(
            self.queue_id.clone(),
            initial,
            receiver,
            self.view_tx.subscribe(),
        )
    }

    async fn resync(&mut self) -> Result<(), QueueError> {
        self.store.reload().await?;
        self.deps
            .directory
            .insert_entries(self.store.history().iter().map(|e| e.id), &self.queue_id);
        self.view_tx
            .send_replace(build_view(&self.record, &self.store, self.sequence));
        Ok(())
    }

    /// Refresh the view, then publish a snapshot and, after a call-next, the
    /// newly serving entry.
    fn publish(&mut self, now_serving: Option<&Entry>) {
        self.sequence += 1;
        let mut view = build_view(&self.record, &self.store, self.sequence);
        let snapshot = QueueEvent::snapshot_of(&view);

        let serving_event = now_serving.map(|entry| {
            self.sequence += 1;
            QueueEvent::NowServing {
                queue_id: self.queue_id.clone(),
                sequence: self.sequence,
                entry: entry.view(),
            }
        });

        view.sequence = self.sequence;
        self.view_tx.send_replace(view);

        self.deps.broadcaster.publish(&self.queue_id, snapshot);
        if let Some(event) = serving_event {
            self.deps.broadcaster.publish(&self.queue_id, event);
        }
    }
}

fn build_view(record: &QueueRecord, store: &QueueStore, sequence: u64) -> QueueView {
    QueueView {
        queue_id: record.queue_id.clone(),
        kind: record.kind.clone(),
        status: record.status,
        waiting: store.waiting_snapshot().iter().map(Entry::view).collect(),
        serving: store.serving_entry().as_ref().map(Entry::view),
        completed_count: store.count_in(EntryState::Completed),
        removed_count: store.count_in(EntryState::Removed),
        sequence,
    }
}
