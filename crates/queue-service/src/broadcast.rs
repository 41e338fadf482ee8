//! Broadcast Channel: keyed pub/sub of queue events.
//!
//! One `tokio::sync::broadcast` channel per queue id, so subscribers of one
//! queue never see another queue's events. The queue actor is the only
//! publisher of its channel, which gives a single publish order per queue.
//!
//! A [`QueueSubscription`] always starts with a fresh `WaitingSnapshot`. If a
//! subscriber falls behind far enough to lose buffered events it gets a new
//! snapshot of the current state instead of a silent gap, and anything older
//! than that snapshot is skipped.

use crate::models::{QueueEvent, QueueView};
use crate::observability::metrics;
use common::types::QueueId;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

#[derive(Debug)]
pub struct QueueBroadcaster {
    capacity: usize,
    channels: RwLock<HashMap<QueueId, broadcast::Sender<QueueEvent>>>,
}

impl QueueBroadcaster {
    /// `capacity` is the per-queue buffer; it must be at least 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Publish to every current subscriber of `queue_id`. Returns how many
    /// receivers got the event; zero when nobody listens.
    pub fn publish(&self, queue_id: &QueueId, event: QueueEvent) -> usize {
        metrics::record_broadcast_event(event.kind_label());

        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = channels.get(queue_id) else {
            return 0;
        };

        let sequence = event.sequence();
        let delivered = sender.send(event).unwrap_or(0);
        trace!(
            target: "qs.broadcast",
            queue_id = %queue_id,
            sequence,
            delivered,
            "Event published"
        );
        delivered
    }

    /// Raw receiver for `queue_id`, creating the channel on first use.
    pub fn subscribe(&self, queue_id: &QueueId) -> broadcast::Receiver<QueueEvent> {
        if let Some(sender) = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_id)
        {
            return sender.subscribe();
        }

        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(queue_id.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Drop the channel; open subscriptions end once they drain.
    pub fn close(&self, queue_id: &QueueId) {
        let removed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue_id);
        if removed.is_some() {
            debug!(target: "qs.broadcast", queue_id = %queue_id, "Channel closed");
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, queue_id: &QueueId) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

/// Live event stream for one queue.
#[derive(Debug)]
pub struct QueueSubscription {
    queue_id: QueueId,
    initial: Option<QueueEvent>,
    receiver: broadcast::Receiver<QueueEvent>,
    view: watch::Receiver<QueueView>,
    last_sequence: u64,
}

impl QueueSubscription {
    /// `initial` must describe the queue as of the moment `receiver` was
    /// created, with no event published in between.
    #[must_use]
    pub fn new(
        queue_id: QueueId,
        initial: QueueEvent,
        receiver: broadcast::Receiver<QueueEvent>,
        view: watch::Receiver<QueueView>,
    ) -> Self {
        Self {
            queue_id,
            last_sequence: initial.sequence(),
            initial: Some(initial),
            receiver,
            view,
        }
    }

    #[must_use]
    pub fn queue_id(&self) -> &QueueId {
        &self.queue_id
    }

    /// Next event, or `None` once the queue's channel is gone.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.sequence() <= self.last_sequence {
                        continue;
                    }
                    self.last_sequence = event.sequence();
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    let snapshot = QueueEvent::snapshot_of(&self.view.borrow());
                    debug!(
                        target: "qs.broadcast",
                        queue_id = %self.queue_id,
                        skipped,
                        sequence = snapshot.sequence(),
                        "Subscriber lagged, resynchronising with a fresh snapshot"
                    );
                    if snapshot.sequence() <= self.last_sequence {
                        continue;
                    }
                    self.last_sequence = snapshot.sequence();
                    return Some(snapshot);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
