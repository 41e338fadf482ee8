//! Actor mailbox monitoring and registry counters.
//!
//! Depth is counted at the source: a handle bumps it before sending, the actor
//! lowers it once the message is handled. Crossing the warning threshold logs
//! once per episode, not once per message.
//!
//! | Actor Type | Warning |
//! |------------|---------|
//! | Registry   | 500     |
//! | Queue      | 100     |

use crate::observability::metrics;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

pub const REGISTRY_MAILBOX_WARNING: usize = 500;
pub const QUEUE_MAILBOX_WARNING: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    /// `QueueRegistryActor` (singleton).
    Registry,
    /// `QueueActor` (one per queue).
    Queue,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Registry => "registry",
            ActorType::Queue => "queue",
        }
    }

    #[must_use]
    pub const fn warning_threshold(&self) -> usize {
        match self {
            ActorType::Registry => REGISTRY_MAILBOX_WARNING,
            ActorType::Queue => QUEUE_MAILBOX_WARNING,
        }
    }
}

#[derive(Debug)]
pub struct MailboxMonitor {
    actor_type: ActorType,
    actor_id: String,
    depth: AtomicUsize,
    processed: AtomicU64,
    over_threshold: AtomicBool,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type,
            actor_id: actor_id.into(),
            depth: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            over_threshold: AtomicBool::new(false),
        }
    }

    /// A handle is about to send a message.
    pub fn record_send(&self) {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth >= self.actor_type.warning_threshold()
            && !self.over_threshold.swap(true, Ordering::Relaxed)
        {
            warn!(
                target: "qs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth above warning threshold"
            );
        }
    }

    /// The send failed; the message never reached the mailbox.
    pub fn record_unsent(&self) {
        self.decrement();
    }

    /// The actor finished handling one message.
    pub fn record_handled(&self) {
        let depth = self.decrement();
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::set_actor_mailbox_depth(self.actor_type.as_str(), depth);

        if depth < self.actor_type.warning_threshold() / 2
            && self.over_threshold.swap(false, Ordering::Relaxed)
        {
            debug!(
                target: "qs.actor.mailbox",
                actor_type = self.actor_type.as_str(),
                actor_id = %self.actor_id,
                depth,
                "Mailbox depth back to normal"
            );
        }
    }

    fn decrement(&self) -> usize {
        let previous = self
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_over_threshold(&self) -> bool {
        self.over_threshold.load(Ordering::Relaxed)
    }
}

/// Counters owned by the registry, readable from its status.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    active_queues: AtomicUsize,
    queues_created: AtomicU64,
    actor_panics: AtomicU64,
}

impl RegistryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_started(&self) {
        let active = self.active_queues.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_active_queues(active);
    }

    pub fn queue_created(&self) {
        self.queues_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_stopped(&self) {
        let previous = self
            .active_queues
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        metrics::set_active_queues(previous.saturating_sub(1));
    }

    pub fn record_panic(&self, actor_type: ActorType) {
        self.actor_panics.fetch_add(1, Ordering::Relaxed);
        metrics::record_actor_panic(actor_type.as_str());
    }

    #[must_use]
    pub fn active_queues(&self) -> usize {
        self.active_queues.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queues_created(&self) -> u64 {
        self.queues_created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn actor_panics(&self) -> u64 {
        self.actor_panics.load(Ordering::Relaxed)
    }
}
