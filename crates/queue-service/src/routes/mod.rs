//! HTTP routes for the queue service.
//!
//! Defines the Axum router and application state.

use crate::engine::QueueEngine;
use crate::handlers;
use crate::middleware::{require_caller, require_operator_otp};
use crate::observability::{health_router, HealthState};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use common::identity::OtpVerifier;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: QueueEngine,
    /// Identity Provider's OTP check for staff call-next and remove.
    /// `None` leaves operator verification to the upstream gateway.
    pub operator_otp: Option<Arc<dyn OtpVerifier>>,
}

impl AppState {
    #[must_use]
    pub fn new(engine: QueueEngine) -> Self {
        Self {
            engine,
            operator_otp: None,
        }
    }

    #[must_use]
    pub fn with_operator_otp(mut self, verifier: Arc<dyn OtpVerifier>) -> Self {
        self.operator_otp = Some(verifier);
        self
    }
}

/// Build the application routes.
///
/// - `/health`, `/ready` - probes (public)
/// - `/metrics` - Prometheus scrape endpoint (public)
/// - `GET /api/v1/queues/:queue_id` and `/events` - read side (public)
/// - every other `/api/v1` route requires a caller role
/// - call-next and entry removal also pass the operator OTP check
/// - TraceLayer for request logging, 30 second request timeout
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let public_routes = Router::new()
        .route("/api/v1/queues/:queue_id", get(handlers::get_queue))
        .route("/api/v1/queues/:queue_id/events", get(handlers::queue_events))
        .with_state(state.clone());

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    let operator_routes = Router::new()
        .route("/api/v1/queues/:queue_id/call-next", post(handlers::call_next))
        .route("/api/v1/entries/:entry_id", delete(handlers::remove_entry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator_otp,
        ));

    // require_caller wraps the operator check, so `Caller` is set before it runs.
    let protected_routes = Router::new()
        .route("/api/v1/queues", post(handlers::create_queue))
        .route("/api/v1/queues/:queue_id/join", post(handlers::join_queue))
        .route("/api/v1/sessions/join", post(handlers::join_by_code))
        .route("/api/v1/queues/:queue_id/end", post(handlers::end_queue))
        .route("/api/v1/queues/:queue_id/history", get(handlers::get_history))
        .merge(operator_routes)
        .route_layer(middleware::from_fn(require_caller))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    public_routes
        .merge(protected_routes)
        .merge(metrics_routes)
        .merge(health_router(health_state))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}
