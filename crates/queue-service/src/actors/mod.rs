//! Actor model for the queue service.
//!
//! ```text
//! QueueRegistryActor (singleton per instance)
//! └── supervises N QueueActors
//!     └── QueueActor (one per queue)
//!         ├── owns the QueueStore
//!         └── publishes to the queue's broadcast channel
//! ```
//!
//! All mutations of one queue go through its actor's mailbox, which is what
//! serializes them. Reads go through the shared `QueueDirectory` and each
//! actor's `watch` view instead.
//!
//! # Modules
//!
//! - [`registry`] - `QueueRegistryActor`: create/restore/shutdown of queues
//! - [`queue`] - `QueueActor`: lifecycle state machine of one queue
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and registry counters

pub mod messages;
pub mod metrics;
pub mod queue;
pub mod registry;

pub use messages::{QueueMessage, RegistryMessage, RegistryStatus};
pub use metrics::{ActorType, MailboxMonitor, RegistryMetrics};
pub use queue::{QueueActor, QueueActorHandle, QueueDeps};
pub use registry::{QueueRegistryActor, QueueRegistryHandle};
