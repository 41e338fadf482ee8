//! Observability for the queue service.
//!
//! Instrumentation uses `#[instrument(skip_all)]` with an explicit allow-list of
//! fields (`queue_id`, `entry_id`, `token`). Display names and contact details
//! are never recorded in spans, logs or metric labels.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `qs_joins_total` | Counter | `outcome` |
//! | `qs_call_next_total` | Counter | `outcome` |
//! | `qs_call_next_duration_seconds` | Histogram | none |
//! | `qs_removals_total` | Counter | `outcome` |
//! | `qs_persistence_retries_total` | Counter | `operation` |
//! | `qs_broadcast_events_total` | Counter | `kind` |
//! | `qs_active_queues` | Gauge | none |
//! | `qs_actor_mailbox_depth` | Gauge | `actor_type` |
//! | `qs_actor_panics_total` | Counter | `actor_type` |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
