//! Broadcast channel tests: ordering, fresh snapshots and per-queue scoping.

use common::identity::CallerRole;
use queue_service::broadcast::QueueSubscription;
use queue_service::errors::QueueError;
use queue_service::models::{JoinRequest, QueueEvent, QueueStatus};
use queue_test_utils::{create_clinic, join_all, test_engine, TEST_SHUTDOWN_DEADLINE};
use std::time::Duration;
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

async fn next_event(subscription: &mut QueueSubscription) -> QueueEvent {
    timeout(RECV_TIMEOUT, subscription.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription closed")
}

fn waiting_tokens(event: &QueueEvent) -> Option<Vec<u64>> {
    match event {
        QueueEvent::WaitingSnapshot { entries, .. } => {
            Some(entries.iter().map(|e| e.token).collect())
        }
        QueueEvent::NowServing { .. } => None,
    }
}

#[tokio::test]
async fn test_subscriber_sees_snapshot_then_ordered_events() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_board").await;
    let mut subscription = engine.subscribe(&queue).await?;

    let initial = next_event(&mut subscription).await;
    assert_eq!(waiting_tokens(&initial), Some(vec![]));
    assert_eq!(initial.sequence(), 0);

    join_all(&engine, &queue, &["Ann", "Ben"]).await;
    let after_ann = next_event(&mut subscription).await;
    let after_ben = next_event(&mut subscription).await;
    assert_eq!(waiting_tokens(&after_ann), Some(vec![1]));
    assert_eq!(waiting_tokens(&after_ben), Some(vec![1, 2]));

    engine.call_next(CallerRole::Provider, &queue).await?;
    let snapshot = next_event(&mut subscription).await;
    let now_serving = next_event(&mut subscription).await;
    assert_eq!(waiting_tokens(&snapshot), Some(vec![2]));
    assert!(matches!(
        &now_serving,
        QueueEvent::NowServing { entry, .. } if entry.token == 1
    ));

    let sequences: Vec<_> = [&initial, &after_ann, &after_ben, &snapshot, &now_serving]
        .iter()
        .map(|e| e.sequence())
        .collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);

    // The view a client re-reads after an event is at least that fresh.
    assert!(engine.queue_view(&queue)?.sequence >= now_serving.sequence());

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

/// Calling next on an empty line still pushes the (empty) board, and the last
/// patient served is shown as completed.
#[tokio::test]
async fn test_empty_call_next_publishes_snapshot() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_quiet").await;
    let mut subscription = engine.subscribe(&queue).await?;
    assert_eq!(next_event(&mut subscription).await.sequence(), 0);

    let result = engine.call_next(CallerRole::Provider, &queue).await;
    assert!(matches!(result, Err(QueueError::QueueEmpty)));
    let snapshot = next_event(&mut subscription).await;
    assert_eq!(waiting_tokens(&snapshot), Some(vec![]));
    assert_eq!(snapshot.sequence(), 1);

    join_all(&engine, &queue, &["Ann"]).await;
    engine.call_next(CallerRole::Provider, &queue).await?;
    let result = engine.call_next(CallerRole::Provider, &queue).await;
    assert!(matches!(result, Err(QueueError::QueueEmpty)));

    // Skip the join and the call-next pair, then the empty call.
    for _ in 0..3 {
        next_event(&mut subscription).await;
    }
    let last = next_event(&mut subscription).await;
    assert!(matches!(
        last,
        QueueEvent::WaitingSnapshot { entries, serving: None, sequence: 5, .. } if entries.is_empty()
    ));
    assert_eq!(engine.queue_view(&queue)?.completed_count, 1);

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_late_subscriber_starts_from_current_state() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_late").await;
    join_all(&engine, &queue, &["Ann", "Ben", "Cat"]).await;
    engine.call_next(CallerRole::Provider, &queue).await?;

    let mut subscription = engine.subscribe(&queue).await?;
    let initial = next_event(&mut subscription).await;
    match &initial {
        QueueEvent::WaitingSnapshot {
            entries, serving, ..
        } => {
            assert_eq!(entries.iter().map(|e| e.token).collect::<Vec<_>>(), vec![2, 3]);
            assert_eq!(serving.as_ref().map(|e| e.token), Some(1));
        }
        QueueEvent::NowServing { .. } => unreachable!("subscription must open with a snapshot"),
    }
    assert_eq!(initial.sequence(), engine.queue_view(&queue)?.sequence);

    engine.end_queue(CallerRole::Provider, &queue).await?;
    let closed = next_event(&mut subscription).await;
    assert!(matches!(
        closed,
        QueueEvent::WaitingSnapshot {
            status: QueueStatus::Closed,
            ..
        }
    ));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_events_never_cross_queues() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let watched = create_clinic(&engine, "clinic_watched").await;
    let other = create_clinic(&engine, "clinic_other").await;

    let mut subscription = engine.subscribe(&watched).await?;
    next_event(&mut subscription).await;
    assert_eq!(engine.subscriber_count(&watched), 1);
    assert_eq!(engine.subscriber_count(&other), 0);

    join_all(&engine, &other, &["Ann", "Ben"]).await;
    engine.call_next(CallerRole::Provider, &other).await?;
    engine
        .join(CallerRole::Patient, &watched, JoinRequest::new("Zed"))
        .await?;

    let event = next_event(&mut subscription).await;
    assert_eq!(event.queue_id(), &watched);
    assert_eq!(waiting_tokens(&event), Some(vec![1]));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_contact_is_never_broadcast() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_private").await;
    let mut subscription = engine.subscribe(&queue).await?;
    next_event(&mut subscription).await;

    engine
        .join(
            CallerRole::Patient,
            &queue,
            JoinRequest::new("Ann").with_contact("+15550100"),
        )
        .await?;
    let event = next_event(&mut subscription).await;
    let wire = serde_json::to_string(&event)?;
    assert!(wire.contains("Ann"));
    assert!(!wire.contains("+15550100"));

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    Ok(())
}

#[tokio::test]
async fn test_subscription_ends_on_shutdown() -> Result<(), anyhow::Error> {
    let engine = test_engine().await;
    let queue = create_clinic(&engine, "clinic_closing_stream").await;
    let mut subscription = engine.subscribe(&queue).await?;
    next_event(&mut subscription).await;

    engine.shutdown(TEST_SHUTDOWN_DEADLINE).await?;
    let end = timeout(RECV_TIMEOUT, subscription.recv()).await?;
    assert!(end.is_none());
    Ok(())
}
