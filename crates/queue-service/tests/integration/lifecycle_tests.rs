//! Lifecycle tests driven through the engine facade.
//!
//! Covers the join -> serve -> complete walk, FIFO order, removal, closing a
//! queue and idempotent joins.

use common::identity::CallerRole;
use queue_service::errors::QueueError;
use queue_service::models::{EntryState, JoinRequest, QueueStatus};
use queue_test_utils::{create_clinic, create_session, join_all, test_engine, TEST_SHUTDOWN_DEADLINE};

/// Alice and Bob join, are served in turn, and a third call finds the queue
/// empty with Bob completed.
#[tokio::test]
async fn test_two_patient_walkthrough() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_1").await;

    let alice = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Alice"))
        .await?;
    let bob = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Bob"))
        .await?;
    assert_eq!(alice.entry.token, 1);
    assert_eq!(bob.entry.token, 2);

    let first = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(first.serving.id, alice.entry.id);
    assert!(first.completed.is_none());
    let view = engine.queue_view(&queue)?;
    assert_eq!(
        view.waiting.iter().map(|e| e.token).collect::<Vec<_>>(),
        vec![2]
    );
    assert_eq!(view.serving.as_ref().map(|e| e.token), Some(1));

    let second = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(second.serving.id, bob.entry.id);
    let completed = second.completed.expect("Alice should be completed");
    assert_eq!(completed.id, alice.entry.id);
    assert_eq!(completed.state, EntryState::Completed);
    assert!(engine.queue_view(&queue)?.waiting.is_empty());

    let third = engine.call_next(CallerRole::Provider, &queue).await;
    assert!(matches!(third, Err(QueueError::QueueEmpty)));

    let view = engine.queue_view(&queue)?;
    assert!(view.serving.is_none());
    assert_eq!(view.completed_count, 2);

    let history = engine.history(&queue).await?;
    let states: Vec<_> = history.iter().map(|e| (e.token, e.state)).collect();
    assert_eq!(
        states,
        vec![(1, EntryState::Completed), (2, EntryState::Completed)]
    );

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_call_next_on_never_joined_queue_is_empty() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_empty").await;

    let result = engine.call_next(CallerRole::Admin, &queue).await;
    assert!(matches!(result, Err(QueueError::QueueEmpty)));
    let view = engine.queue_view(&queue)?;
    assert_eq!(view.sequence, 1);
    assert!(view.waiting.is_empty() && view.serving.is_none());

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// Whatever mix of joins, removals and calls happened before, the next call
/// serves the smallest waiting token.
#[tokio::test]
async fn test_call_next_serves_smallest_waiting_token() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_fifo").await;
    let joined = join_all(&engine, &queue, &["A", "B", "C", "D", "E"]).await;
    let ids: Vec<_> = joined.iter().map(|j| j.entry.id).collect();

    // Remove B and D while A waits.
    for id in ids.iter().skip(1).step_by(2) {
        engine.remove(CallerRole::Provider, *id).await?;
    }

    let mut served = Vec::new();
    loop {
        match engine.call_next(CallerRole::Provider, &queue).await {
            Ok(outcome) => {
                let view = engine.queue_view(&queue)?;
                if let Some(head) = view.waiting.first() {
                    assert!(head.token > outcome.serving.token);
                }
                served.push(outcome.serving.token);
            }
            Err(QueueError::QueueEmpty) => break,
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(served, vec![1, 3, 5]);

    let history = engine.history(&queue).await?;
    assert_eq!(
        history.iter().filter(|e| e.state == EntryState::Serving).count(),
        0
    );
    assert_eq!(
        history.iter().filter(|e| e.state == EntryState::Removed).count(),
        2
    );

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_remove_twice_is_same_as_once() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_remove").await;
    let joined = join_all(&engine, &queue, &["Ann", "Ben"]).await;
    let ann = joined.first().expect("Ann joined").entry.id;

    let first = engine.remove(CallerRole::Provider, ann).await?;
    assert!(first.changed);
    assert_eq!(first.entry.state, EntryState::Removed);
    let view_after_first = engine.queue_view(&queue)?;

    let second = engine.remove(CallerRole::Provider, ann).await?;
    assert!(!second.changed);
    assert_eq!(second.entry.state, EntryState::Removed);
    assert_eq!(second.entry.finished_at, first.entry.finished_at);

    let view = engine.queue_view(&queue)?;
    assert_eq!(view.waiting, view_after_first.waiting);
    assert_eq!(view.removed_count, 1);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// Removing the entry being served frees the serving slot without marking it
/// completed.
#[tokio::test]
async fn test_remove_serving_entry() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_no_show").await;
    join_all(&engine, &queue, &["Ann", "Ben"]).await;

    let serving = engine.call_next(CallerRole::Provider, &queue).await?.serving;
    engine.remove(CallerRole::Provider, serving.id).await?;
    assert!(engine.queue_view(&queue)?.serving.is_none());

    let next = engine.call_next(CallerRole::Provider, &queue).await?;
    assert_eq!(next.serving.token, 2);
    assert!(next.completed.is_none());

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// An ended queue refuses joins but keeps serving who is already waiting.
#[tokio::test]
async fn test_ended_queue_drains_without_new_joins() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_closing").await;
    join_all(&engine, &queue, &["Ann", "Ben"]).await;

    let view = engine.end_queue(CallerRole::Provider, &queue).await?;
    assert_eq!(view.status, QueueStatus::Closed);
    let again = engine.end_queue(CallerRole::Admin, &queue).await?;
    assert_eq!(again.sequence, view.sequence);

    let refused = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Late"))
        .await;
    assert!(matches!(refused, Err(QueueError::QueueClosed(_))));

    assert_eq!(engine.call_next(CallerRole::Provider, &queue).await?.serving.token, 1);
    assert_eq!(engine.call_next(CallerRole::Provider, &queue).await?.serving.token, 2);
    assert!(matches!(
        engine.call_next(CallerRole::Provider, &queue).await,
        Err(QueueError::QueueEmpty)
    ));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_idempotency_key_returns_original_token() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_retry").await;

    let request = JoinRequest::new("Ann").with_idempotency_key("req-1");
    let original = engine
        .join(CallerRole::Patient, &queue, request.clone())
        .await?;
    let repeat = engine.join(CallerRole::Patient, &queue, request).await?;
    assert!(!original.replayed);
    assert!(repeat.replayed);
    assert_eq!(repeat.entry.id, original.entry.id);
    assert_eq!(repeat.entry.token, original.entry.token);

    let other = engine
        .join(
            CallerRole::Patient,
            &queue,
            JoinRequest::new("Ann").with_idempotency_key("req-2"),
        )
        .await?;
    assert_eq!(other.entry.token, 2);
    assert_eq!(engine.queue_view(&queue)?.waiting.len(), 2);

    // A replay still answers after the queue is closed.
    engine.end_queue(CallerRole::Provider, &queue).await?;
    let late_repeat = engine
        .join(
            CallerRole::Patient,
            &queue,
            JoinRequest::new("Ann").with_idempotency_key("req-1"),
        )
        .await?;
    assert!(late_repeat.replayed);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_session_join_code_flow() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let session = create_session(&engine, "dr_grey", "Saturday walk-ins").await;
    let code = session.kind.join_code().expect("session has a join code");
    assert_eq!(code.len(), 6);

    let joined = engine
        .join_by_code(CallerRole::Patient, code, JoinRequest::new("Ann"))
        .await?;
    assert_eq!(joined.entry.queue_id, session.queue_id);
    assert_eq!(joined.entry.token, 1);

    let outcome = engine
        .call_next(CallerRole::Provider, &session.queue_id)
        .await?;
    assert_eq!(outcome.serving.id, joined.entry.id);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_shutdown").await;
    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;

    let join = engine
        .join(CallerRole::Patient, &queue, JoinRequest::new("Ann"))
        .await;
    assert!(join.is_err());
    Ok(())
}
