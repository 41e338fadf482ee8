//! HTTP request handlers for the queue service.

pub mod events;
pub mod metrics;
pub mod queues;

pub use events::queue_events;
pub use metrics::metrics_handler;
pub use queues::{
    call_next, create_queue, end_queue, get_history, get_queue, join_by_code, join_queue,
    remove_entry,
};
