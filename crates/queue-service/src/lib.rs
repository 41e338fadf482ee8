//! Queue Service Library
//!
//! Walk-in queue lifecycle engine for clinics and ad-hoc sessions:
//!
//! - Strictly increasing, never reused tokens per queue
//! - FIFO serving with at most one entry being served per queue
//! - Atomic call-next (complete current, serve next) persisted as one batch
//! - Real-time fan-out of waiting snapshots and now-serving events
//! - Graceful drain: closed queues refuse joins but keep serving
//!
//! # Architecture
//!
//! ```text
//! HTTP / WebSocket (axum)
//! └── QueueEngine (role checks, routing through QueueDirectory)
//!     └── QueueRegistryActor (singleton)
//!         └── QueueActor (one per queue)
//!             ├── QueueStore -> EntryRepository (memory or redis)
//!             ├── TokenAllocator
//!             └── QueueBroadcaster
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry and per-queue actors
//! - [`allocator`] - Per-queue token counters
//! - [`broadcast`] - Per-queue pub/sub of queue events
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Facade used by the HTTP glue
//! - [`errors`] - Error types with HTTP mapping
//! - [`store`] - Queue store and persistence backends

pub mod actors;
pub mod allocator;
pub mod broadcast;
pub mod config;
pub mod directory;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod observability;
pub mod routes;
pub mod store;
