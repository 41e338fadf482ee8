//! Engine builders and request helpers.

use common::identity::CallerRole;
use common::types::QueueId;
use queue_service::allocator::{AtomicTokenAllocator, TokenAllocator};
use queue_service::engine::{EngineSettings, QueueEngine};
use queue_service::models::{CreateQueueRequest, JoinOutcome, JoinRequest, QueueRecord};
use queue_service::store::{EntryRepository, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;

/// Grace period tests give `QueueEngine::shutdown`.
pub const TEST_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// Three attempts with a millisecond of backoff, so retry tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        instance_id: "qs-test".to_string(),
        retry: fast_retry(),
        ..EngineSettings::default()
    }
}

/// Engine over the given repository with a fresh in-memory allocator.
pub async fn engine_over(repository: Arc<dyn EntryRepository>) -> QueueEngine {
    engine_with(repository, Arc::new(AtomicTokenAllocator::new())).await
}

pub async fn engine_with(
    repository: Arc<dyn EntryRepository>,
    allocator: Arc<dyn TokenAllocator>,
) -> QueueEngine {
    QueueEngine::start(test_settings(), repository, allocator)
        .await
        .expect("test engine failed to start")
}

/// Engine over the in-memory backends.
pub async fn test_engine() -> QueueEngine {
    QueueEngine::in_memory(test_settings())
        .await
        .expect("test engine failed to start")
}

/// Create a clinic queue whose id is `clinic_id`.
pub async fn create_clinic(engine: &QueueEngine, clinic_id: &str) -> QueueId {
    engine
        .create_queue(CallerRole::Provider, CreateQueueRequest::clinic(clinic_id))
        .await
        .expect("clinic creation failed")
        .queue_id
}

pub async fn create_session(engine: &QueueEngine, host: &str, title: &str) -> QueueRecord {
    engine
        .create_queue(CallerRole::Provider, CreateQueueRequest::session(host, title))
        .await
        .expect("session creation failed")
}

/// Join one patient per name, in order.
pub async fn join_all(engine: &QueueEngine, queue_id: &QueueId, names: &[&str]) -> Vec<JoinOutcome> {
    let mut outcomes = Vec::with_capacity(names.len());
    for name in names {
        let outcome = engine
            .join(CallerRole::Patient, queue_id, JoinRequest::new(*name))
            .await
            .expect("join failed");
        outcomes.push(outcome);
    }
    outcomes
}
