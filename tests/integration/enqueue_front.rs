//! Test: priority delivery, completion, and terminal-state immutability.

use revq::{Item, QueueError};
use tokio_util::sync::CancellationToken;

use crate::common::{assert_item_eq, assert_no_event, recv_within, test_queue};

const BUCKET: &str = "test-bucket";

#[tokio::test]
async fn test_front_delivers_priority_order() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    // A subscription on an empty bucket has no head to deliver.
    let mut early_front = queue.front(&token, BUCKET).expect("front");
    assert_no_event(&mut early_front).await;

    let item1 = Item::new(BUCKET, 1000, "test-data");
    let _done1 = queue
        .enqueue(&token, item1.clone())
        .await
        .expect("enqueue item1");

    let first = recv_within(&mut early_front, 5)
        .await
        .expect("first head delivery");
    assert_item_eq(&item1, &first);

    // A heavier item becomes the new head.
    let item2 = Item::new(BUCKET, 9000, "test-data-2");
    let _done2 = queue
        .enqueue(&token, item2.clone())
        .await
        .expect("enqueue item2");

    let second = recv_within(&mut early_front, 5)
        .await
        .expect("second head delivery");
    assert_item_eq(&item2, &second);

    // A subscription opened after both enqueues sees the heavier item first.
    let mut late_front = queue.front(&token, BUCKET).expect("front");
    let head = recv_within(&mut late_front, 5).await.expect("head");
    assert_item_eq(&item2, &head);

    queue.stop().await;
}

#[tokio::test]
async fn test_completion_closes_watchers_and_moves_record() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let item1 = Item::new(BUCKET, 1000, "test-data");
    let _done1 = queue
        .enqueue(&token, item1.clone())
        .await
        .expect("enqueue item1");
    let item2 = Item::new(BUCKET, 9000, "test-data-2");
    let mut done2 = queue
        .enqueue(&token, item2.clone())
        .await
        .expect("enqueue item2");

    // Simulate a worker: take the head, finish the work, report completion.
    let mut front = queue.front(&token, BUCKET).expect("front");
    let mut from_queue = recv_within(&mut front, 5).await.expect("head");
    assert_item_eq(&item2, &from_queue);
    drop(front);

    // Enqueue subscriptions stay silent while the item is in flight.
    assert_no_event(&mut done2).await;

    from_queue.progress = 100;
    from_queue.value = "new-data".to_string();
    let mut done_update = queue
        .enqueue(&token, from_queue.clone())
        .await
        .expect("enqueue completion");

    // Both subscriptions receive exactly the updated item, then close.
    let event = recv_within(&mut done_update, 5).await.expect("terminal");
    assert_item_eq(&from_queue, &event);
    assert!(recv_within(&mut done_update, 5).await.is_none());

    let event = recv_within(&mut done2, 5).await.expect("terminal");
    assert_item_eq(&from_queue, &event);
    assert!(recv_within(&mut done2, 5).await.is_none());

    // The record moved to the completed prefix.
    let completed_key = queue.config().completed_key_for(&item2.key);
    let kv = queue
        .client()
        .get(&completed_key)
        .await
        .expect("get completed record")
        .expect("completed record exists");
    let stored: Item = serde_json::from_slice(&kv.value).expect("decode completed record");
    assert_item_eq(&from_queue, &stored);
    assert!(queue
        .client()
        .get(&item2.key)
        .await
        .expect("get pending record")
        .is_none());

    // The next head is the remaining item.
    let mut front = queue.front(&token, BUCKET).expect("front");
    let head = recv_within(&mut front, 5).await.expect("head");
    assert_item_eq(&item1, &head);

    queue.stop().await;
}

#[tokio::test]
async fn test_reenqueue_of_completed_item_is_rejected() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 5000, "test-data");
    item.progress = 100;
    let mut done = queue
        .enqueue(&token, item.clone())
        .await
        .expect("enqueue completed item");
    let event = recv_within(&mut done, 5).await.expect("terminal");
    assert_item_eq(&item, &event);

    // Terminal states are immutable, whatever the retry looks like.
    item.progress = 0;
    let err = queue
        .enqueue(&token, item.clone())
        .await
        .expect_err("re-enqueue must fail");
    assert!(matches!(err, QueueError::TerminalState { .. }), "got {err}");

    // The store is unchanged: no pending record, original completed record.
    assert!(queue
        .client()
        .get(&item.key)
        .await
        .expect("get pending")
        .is_none());
    let completed_key = queue.config().completed_key_for(&item.key);
    let kv = queue
        .client()
        .get(&completed_key)
        .await
        .expect("get completed")
        .expect("completed record exists");
    let stored: Item = serde_json::from_slice(&kv.value).expect("decode");
    assert_eq!(stored.progress, 100);

    queue.stop().await;
}

#[tokio::test]
async fn test_progress_overflow_is_clamped_to_done() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 10, "test-data");
    item.progress = 150;
    let mut done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    let event = recv_within(&mut done, 5).await.expect("terminal");
    assert_eq!(event.progress, 100);
    assert!(recv_within(&mut done, 5).await.is_none());

    let completed_key = queue.config().completed_key_for(&item.key);
    assert!(queue
        .client()
        .get(&completed_key)
        .await
        .expect("get completed")
        .is_some());

    queue.stop().await;
}

#[tokio::test]
async fn test_error_forces_completion() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 10, "test-data");
    item.progress = 30;
    item.error = "handler exploded".to_string();
    let mut done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    let event = recv_within(&mut done, 5).await.expect("terminal");
    assert_eq!(event.error, "handler exploded");
    assert_eq!(event.progress, 30);
    assert!(recv_within(&mut done, 5).await.is_none());

    // Failed items never appear under the pending prefix.
    assert!(queue
        .client()
        .get(&item.key)
        .await
        .expect("get pending")
        .is_none());

    queue.stop().await;
}

#[tokio::test]
async fn test_json_round_trip_equality() {
    let item = Item::new(BUCKET, 4242, "payload");
    let encoded = serde_json::to_vec(&item).expect("encode");
    let decoded: Item = serde_json::from_slice(&encoded).expect("decode");
    assert_item_eq(&item, &decoded);
}
