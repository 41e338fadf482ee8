//! Queue Service
//!
//! Hosts the queue lifecycle engine behind HTTP and WebSocket.
//!
//! Startup:
//! 1. Tracing and configuration
//! 2. Prometheus recorder
//! 3. Persistence backend (redis when `REDIS_URL` is set, memory otherwise)
//! 4. Engine start, restoring persisted queues
//! 5. HTTP server; `/ready` flips once the engine is up
//!
//! On SIGTERM/SIGINT the server stops accepting requests, readiness drops,
//! and the engine drains its queue actors within the shutdown deadline.

use queue_service::allocator::{AtomicTokenAllocator, TokenAllocator};
use queue_service::config::Config;
use queue_service::engine::{EngineSettings, QueueEngine};
use queue_service::observability::metrics::init_metrics_recorder;
use queue_service::observability::HealthState;
use queue_service::routes::{self, AppState};
use queue_service::store::redis::RedisRepository;
use queue_service::store::{EntryRepository, InMemoryRepository};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "queue_service=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting Queue Service");
    info!(
        instance_id = %config.instance_id,
        http_bind_address = %config.http_bind_address,
        backend = if config.redis_url.is_some() { "redis" } else { "memory" },
        persist_max_attempts = config.persist_max_attempts,
        broadcast_capacity = config.broadcast_capacity,
        max_queues = config.max_queues,
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize metrics");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    let (repository, allocator): (Arc<dyn EntryRepository>, Arc<dyn TokenAllocator>) =
        match &config.redis_url {
            Some(redis_url) => {
                info!("Connecting to Redis...");
                let redis = Arc::new(RedisRepository::connect(redis_url).await.map_err(|e| {
                    error!(error = %e, "Failed to connect to Redis");
                    e
                })?);
                info!("Redis connection established");
                let repository: Arc<dyn EntryRepository> = redis.clone();
                let allocator: Arc<dyn TokenAllocator> = redis;
                (repository, allocator)
            }
            None => {
                warn!("REDIS_URL not set, queues live in memory only");
                (
                    Arc::new(InMemoryRepository::new()),
                    Arc::new(AtomicTokenAllocator::new()),
                )
            }
        };

    let engine = QueueEngine::start(EngineSettings::from_config(&config), repository, allocator)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to start queue engine");
            e
        })?;

    // Operator codes are checked by the gateway in front of this service.
    let state = Arc::new(AppState::new(engine.clone()));
    let app = routes::build_routes(state, Arc::clone(&health_state), prometheus_handle);

    let addr: SocketAddr = config.http_bind_address.parse().map_err(|e| {
        error!(error = %e, "Invalid bind address");
        e
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Queue Service listening");

    health_state.set_ready();

    let shutdown_health = Arc::clone(&health_state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, initiating graceful shutdown...");
            shutdown_health.set_not_ready();
        })
        .await?;

    if let Err(e) = engine.shutdown(config.shutdown_deadline).await {
        warn!(error = %e, "Queue engine shutdown error");
    }

    info!("Queue Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
