//! Restart tests: a new engine over the same repository picks up every
//! queue where the previous one stopped.

use common::identity::CallerRole;
use queue_service::allocator::AtomicTokenAllocator;
use queue_service::engine::QueueEngine;
use queue_service::errors::QueueError;
use queue_service::models::{EntryState, JoinRequest, QueueStatus};
use queue_test_utils::{
    create_clinic, create_session, engine_over, join_all, test_settings, FaultyRepository,
    TEST_SHUTDOWN_DEADLINE,
};
use std::sync::Arc;

#[tokio::test]
async fn test_restart_restores_queues_and_tokens() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());

    let engine = engine_over(repository.clone()).await;
    let clinic = create_clinic(&engine, "clinic_1").await;
    let session = create_session(&engine, "dr_grey", "Evening").await;
    let code = session
        .kind
        .join_code()
        .expect("session has a join code")
        .to_string();
    join_all(&engine, &clinic, &["Ann", "Ben", "Cat"]).await;
    engine
        .join(
            CallerRole::Patient,
            &clinic,
            JoinRequest::new("Dan").with_idempotency_key("dan-1"),
        )
        .await?;
    engine.call_next(CallerRole::Provider, &clinic).await?;
    let removed = engine
        .history(&clinic)
        .await?
        .into_iter()
        .find(|e| e.token == 3)
        .expect("token 3 exists");
    engine.remove(CallerRole::Provider, removed.id).await?;
    engine.end_queue(CallerRole::Provider, &session.queue_id).await?;
    let before = engine.queue_view(&clinic)?;
    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;

    let restarted = engine_over(repository.clone()).await;
    assert_eq!(restarted.status().await?.queue_count, 2);

    let view = restarted.queue_view(&clinic)?;
    assert_eq!(view.waiting, before.waiting);
    assert_eq!(view.serving, before.serving);
    assert_eq!(view.removed_count, 1);

    // Tokens continue after the highest one ever issued.
    let joined = restarted
        .join(CallerRole::Patient, &clinic, JoinRequest::new("Eve"))
        .await?;
    assert_eq!(joined.entry.token, 5);

    // Idempotency keys survive the restart.
    let replay = restarted
        .join(
            CallerRole::Patient,
            &clinic,
            JoinRequest::new("Dan").with_idempotency_key("dan-1"),
        )
        .await?;
    assert!(replay.replayed);
    assert_eq!(replay.entry.token, 4);

    // Entry ids and join codes route again.
    restarted.remove(CallerRole::Provider, removed.id).await?;
    let session_view = restarted.queue_view(&session.queue_id)?;
    assert_eq!(session_view.status, QueueStatus::Closed);
    assert!(matches!(
        restarted
            .join_by_code(CallerRole::Patient, &code, JoinRequest::new("Fay"))
            .await,
        Err(QueueError::QueueClosed(_))
    ));

    restarted.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_restore_retries_transient_entry_loads() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let clinic = create_clinic(&engine, "clinic_reload").await;
    join_all(&engine, &clinic, &["Ann"]).await;
    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;

    repository.fail_next_entry_loads(2);
    let restarted = engine_over(repository.clone()).await;
    assert_eq!(restarted.queue_view(&clinic)?.waiting.len(), 1);

    restarted.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_restore_fails_when_backend_is_down() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    repository.set_offline(true);

    let started = QueueEngine::start(
        test_settings(),
        repository.clone(),
        Arc::new(AtomicTokenAllocator::new()),
    )
    .await;
    assert!(started.is_err());
    Ok(())
}

/// Two serving entries in storage break the at-most-one-serving invariant;
/// the engine refuses to start on them.
#[tokio::test]
async fn test_restore_rejects_corrupt_queue() -> Result<(), anyhow::Error> {
    let repository = Arc::new(FaultyRepository::new());
    let engine = engine_over(repository.clone()).await;
    let clinic = create_clinic(&engine, "clinic_corrupt").await;
    let joined = join_all(&engine, &clinic, &["Ann", "Ben"]).await;
    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;

    for outcome in &joined {
        repository
            .inner()
            .overwrite_entry(outcome.entry.advanced(EntryState::Serving, chrono::Utc::now()));
    }

    let started = QueueEngine::start(
        test_settings(),
        repository.clone(),
        Arc::new(AtomicTokenAllocator::new()),
    )
    .await;
    assert!(started.is_err());
    Ok(())
}
