//! Test: mid-life observers and cancellation propagation.

use revq::Item;
use tokio_util::sync::CancellationToken;

use crate::common::{assert_item_eq, assert_no_event, recv_within, test_queue};

const BUCKET: &str = "test-bucket";

#[tokio::test]
async fn test_watch_observes_midlife_updates() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 5000, "test-data");
    let _done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    // Observer installed after the item already exists in the store.
    let observer_token = CancellationToken::new();
    let mut observer = queue.watch(&observer_token, &item.key).expect("watch");

    // Simulate a worker reporting progress.
    item.progress = 50;
    item.value = "new-data".to_string();
    let _update = queue
        .enqueue(&token, item.clone())
        .await
        .expect("re-enqueue");

    let event = recv_within(&mut observer, 5).await.expect("progress update");
    assert_item_eq(&item, &event);

    // Cancelling the observer's token closes its channel.
    observer_token.cancel();
    assert!(recv_within(&mut observer, 5).await.is_none());

    queue.stop().await;
}

#[tokio::test]
async fn test_watch_closes_after_terminal_event() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 5000, "test-data");
    let _done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    let mut observer = queue.watch(&token, &item.key).expect("watch");

    item.progress = 100;
    let _update = queue
        .enqueue(&token, item.clone())
        .await
        .expect("complete");

    let event = recv_within(&mut observer, 5).await.expect("terminal");
    assert!(event.is_completed());
    assert!(recv_within(&mut observer, 5).await.is_none());

    queue.stop().await;
}

#[tokio::test]
async fn test_canceling_one_observer_leaves_others_running() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 5000, "test-data");
    let _done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    let doomed_token = CancellationToken::new();
    let mut doomed = queue.watch(&doomed_token, &item.key).expect("watch");
    let mut survivor = queue.watch(&token, &item.key).expect("watch");

    doomed_token.cancel();
    assert!(recv_within(&mut doomed, 5).await.is_none());

    item.progress = 75;
    let _update = queue
        .enqueue(&token, item.clone())
        .await
        .expect("re-enqueue");

    let event = recv_within(&mut survivor, 5).await.expect("update");
    assert_item_eq(&item, &event);

    queue.stop().await;
}

#[tokio::test]
async fn test_watch_coalesces_undrained_updates() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();

    let mut item = Item::new(BUCKET, 5000, "test-data");
    let _done = queue.enqueue(&token, item.clone()).await.expect("enqueue");

    let mut observer = queue.watch(&token, &item.key).expect("watch");

    // Two rewrites without the observer draining: the slot keeps the newest.
    item.progress = 10;
    let _u1 = queue.enqueue(&token, item.clone()).await.expect("update 1");
    item.progress = 100;
    let _u2 = queue.enqueue(&token, item.clone()).await.expect("update 2");

    // The terminal event is always observable before closure.
    let mut last = recv_within(&mut observer, 5).await.expect("event");
    if !last.is_completed() {
        last = recv_within(&mut observer, 5).await.expect("terminal event");
    }
    assert!(last.is_completed());
    assert_item_eq(&item, &last);
    assert!(recv_within(&mut observer, 5).await.is_none());

    queue.stop().await;
}

#[tokio::test]
async fn test_front_closes_on_token_cancel_only() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;
    let token = CancellationToken::new();
    let front_token = CancellationToken::new();

    let mut front = queue.front(&front_token, BUCKET).expect("front");

    // Head transitions do not close the channel.
    let item = Item::new(BUCKET, 1000, "test-data");
    let _done = queue.enqueue(&token, item.clone()).await.expect("enqueue");
    let head = recv_within(&mut front, 5).await.expect("head");
    assert_item_eq(&item, &head);
    assert_no_event(&mut front).await;

    front_token.cancel();
    assert!(recv_within(&mut front, 5).await.is_none());

    queue.stop().await;
}

#[tokio::test]
async fn test_client_endpoints_are_advertised() {
    let fixture = test_queue().await;
    let queue = &fixture.queue;

    let endpoints = queue.client_endpoints();
    assert_eq!(endpoints.len(), 1);
    assert!(endpoints[0].starts_with("http://127.0.0.1:"));

    queue.stop().await;
}
