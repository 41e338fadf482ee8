//! Fault injection tests for persistence failures during mutations.
//!
//! These tests validate that:
//! - Transient write failures are retried with the originally allocated token
//! - A join that ran out of retries resumes with the same token when the
//!   client repeats it with its idempotency key
//! - A call-next that hits a state conflict reloads and retries once, and a
//!   second conflict surfaces as a retryable error with nothing half-applied

use common::identity::CallerRole;
use queue_service::errors::QueueError;
use queue_service::models::{EntryState, JoinRequest};
use queue_test_utils::{create_clinic, engine_over, join_all, FaultyRepository, TEST_SHUTDOWN_DEADLINE};
use std::sync::Arc;

#[tokio::test]
async fn test_transient_insert_failures_keep_the_token() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_flaky").await;

    repository.fail_next_inserts(2);
    let joined = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Ann"))
        .await?;
    assert_eq!(joined.entry.token, 1);
    assert_eq!(repository.insert_calls(), 3);

    // The allocator ran once for the retried join.
    let next = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Ben"))
        .await?;
    assert_eq!(next.entry.token, 2);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_exhausted_join_resumes_with_same_token() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_outage").await;

    repository.fail_next_inserts(3);
    let request = JoinRequest::new("Ann").with_idempotency_key("ann-1");
    let failed = engine
        .join(CallerRole::Patient, &queue, request.clone())
        .await;
    let err = failed.expect_err("join should run out of retries");
    assert!(matches!(err, QueueError::Persistence(_)));
    assert!(err.is_retryable());
    assert!(engine.queue_view(&queue)?.waiting.is_empty());

    let resumed = engine.join(CallerRole::Patient, &queue, request.clone()).await?;
    assert_eq!(resumed.entry.token, 1);
    assert!(!resumed.replayed);

    let replayed = engine.join(CallerRole::Patient, &queue, request).await?;
    assert!(replayed.replayed);
    assert_eq!(replayed.entry.id, resumed.entry.id);

    let other = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Ben"))
        .await?;
    assert_eq!(other.entry.token, 2);
    assert_eq!(repository.inner().entry_count(), 2);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// A failed call-next commit leaves the queue exactly as it was.
#[tokio::test]
async fn test_failed_call_next_is_never_partially_visible() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_atomic").await;
    join_all(&engine, &queue, &["Ann", "Ben"]).await;
    engine.call_next(CallerRole::Provider, &queue).await?;
    let before = engine.queue_view(&queue)?;

    repository.fail_next_applies(3);
    let result = engine.call_next(CallerRole::Provider, &queue).await;
    assert!(matches!(result, Err(QueueError::Persistence(_))));
    assert_eq!(engine.queue_view(&queue)?, before);

    let history = engine.history(&queue).await?;
    let states: Vec<_> = history.iter().map(|e| e.state).collect();
    assert_eq!(states, vec![EntryState::Serving, EntryState::Waiting]);

    let outcome = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(outcome.serving.token, 2);
    assert_eq!(outcome.completed.map(|e| e.token), Some(1));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_single_conflict_is_recovered() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_conflict").await;
    join_all(&engine, &queue, &["Ann"]).await;

    repository.conflict_next_applies(1);
    let outcome = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(outcome.serving.token, 1);
    assert_eq!(repository.apply_calls(), 2);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_repeated_conflict_surfaces_as_stale_state() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_contended").await;
    join_all(&engine, &queue, &["Ann"]).await;

    repository.conflict_next_applies(2);
    let err = engine
        .call_next(CallerRole::Provider, &queue)
        .await
        .expect_err("second conflict should surface");
    assert!(matches!(err, QueueError::StaleState { .. }));
    assert_eq!(err.status_code(), 503);

    let view = engine.queue_view(&queue)?;
    assert!(view.serving.is_none());
    assert_eq!(view.waiting.len(), 1);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// Another writer removed the head behind the engine's back; call-next
/// reloads and serves the next entry instead.
#[tokio::test]
async fn test_call_next_recovers_from_out_of_band_write() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_shared").await;
    let joined = join_all(&engine, &queue, &["Ann", "Ben"]).await;
    let ann = joined.first().expect("Ann joined").entry.clone();

    repository
        .inner()
        .overwrite_entry(ann.advanced(EntryState::Removed, chrono::Utc::now()));

    let outcome = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(outcome.serving.token, 2);

    let view = engine.queue_view(&queue)?;
    assert!(view.waiting.is_empty());
    assert_eq!(view.removed_count, 1);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_end_queue_retries_metadata_write() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let queue = create_clinic(&engine, "clinic_end").await;

    repository.fail_next_saves(2);
    engine.end_queue(CallerRole::Provider, &queue).await?;

    repository.fail_next_saves(3);
    let create = engine
        .create_queue(
            CallerRole::Admin,
            queue_service::models::CreateQueueRequest::clinic("clinic_unsaved"),
        )
        .await;
    assert!(matches!(create, Err(QueueError::Persistence(_))));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}
