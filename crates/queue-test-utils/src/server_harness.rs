//! Test server harness for E2E testing
//!
//! Provides `TestQueueServer` for spawning real queue service instances in
//! tests.

use common::identity::OtpVerifier;
use metrics_exporter_prometheus::PrometheusBuilder;
use queue_service::engine::QueueEngine;
use queue_service::observability::HealthState;
use queue_service::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Test harness for spawning the queue service in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_flow_e2e() -> Result<()> {
///     let server = TestQueueServer::spawn(test_engine().await).await?;
///     let response = reqwest::get(format!("{}/health", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestQueueServer {
    addr: SocketAddr,
    engine: QueueEngine,
    health_state: Arc<HealthState>,
    _handle: JoinHandle<()>,
}

impl TestQueueServer {
    /// Serve `engine` on 127.0.0.1 at a random port, marked ready.
    pub async fn spawn(engine: QueueEngine) -> Result<Self, anyhow::Error> {
        Self::serve(AppState::new(engine)).await
    }

    /// Like [`Self::spawn`], but staff call-next and remove must carry a
    /// code that `verifier` accepts.
    pub async fn spawn_with_operator_otp(
        engine: QueueEngine,
        verifier: Arc<dyn OtpVerifier>,
    ) -> Result<Self, anyhow::Error> {
        Self::serve(AppState::new(engine).with_operator_otp(verifier)).await
    }

    async fn serve(state: AppState) -> Result<Self, anyhow::Error> {
        let engine = state.engine.clone();
        let state = Arc::new(state);
        let health_state = Arc::new(HealthState::new());

        // A detached recorder: tests must not fight over the global one.
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();

        let app = routes::build_routes(state, Arc::clone(&health_state), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        health_state.set_ready();

        Ok(Self {
            addr,
            engine,
            health_state,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The engine behind the server, for direct setup and assertions.
    pub fn engine(&self) -> &QueueEngine {
        &self.engine
    }

    pub fn health_state(&self) -> &HealthState {
        &self.health_state
    }
}

impl Drop for TestQueueServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}
