//! Metric recording helpers.
//!
//! Labels are bounded: `outcome` values come from [`QueueError::error_code`]
//! or `"success"`, `operation` from the repository method names, `kind` from
//! the two event kinds, `actor_type` from [`ActorType`].
//!
//! [`QueueError::error_code`]: crate::errors::QueueError::error_code
//! [`ActorType`]: crate::actors::metrics::ActorType

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the render handle.
///
/// Must run before anything is recorded. Fails if a recorder is already
/// installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // call-next is one actor round trip plus one persistence batch
        .set_buckets_for_metric(
            Matcher::Full("qs_call_next_duration_seconds".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set call-next buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// `outcome` label for a result.
pub fn outcome_label<T>(result: &Result<T, crate::errors::QueueError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.error_code(),
    }
}

pub fn record_join(outcome: &'static str) {
    counter!("qs_joins_total", "outcome" => outcome).increment(1);
}

pub fn record_call_next(outcome: &'static str, duration: Duration) {
    counter!("qs_call_next_total", "outcome" => outcome).increment(1);
    histogram!("qs_call_next_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_removal(outcome: &'static str) {
    counter!("qs_removals_total", "outcome" => outcome).increment(1);
}

pub fn record_persistence_retry(operation: &'static str) {
    counter!("qs_persistence_retries_total", "operation" => operation).increment(1);
}

pub fn record_broadcast_event(kind: &'static str) {
    counter!("qs_broadcast_events_total", "kind" => kind).increment(1);
}

pub fn set_active_queues(count: usize) {
    // usize to f64 is exact for any realistic queue count
    #[allow(clippy::cast_precision_loss)]
    gauge!("qs_active_queues").set(count as f64);
}

pub fn set_actor_mailbox_depth(actor_type: &'static str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("qs_actor_mailbox_depth", "actor_type" => actor_type).set(depth as f64);
}

/// Any non-zero value is a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("qs_actor_panics_total", "actor_type" => actor_type).increment(1);
}
