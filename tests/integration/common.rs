//! Common test utilities.

use std::sync::Once;
use std::time::Duration;

use revq::{Item, Queue, ServerConfig, Subscription};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// An embedded queue plus the scratch directory backing it. The directory is
/// removed when the fixture drops.
pub struct TestQueue {
    pub queue: Queue,
    _data_dir: TempDir,
}

/// Starts an embedded queue on ephemeral ports with a scratch data
/// directory.
///
/// # Panics
///
/// Panics when the embedded server cannot start (port binding or data
/// directory creation failed).
pub async fn test_queue() -> TestQueue {
    // Opt-in logging: RUST_LOG=revq=debug cargo test --test integration
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });

    let data_dir = tempfile::tempdir().expect("failed to create scratch data dir");
    let queue = Queue::embedded(ServerConfig::new(0, 0, data_dir.path()))
        .await
        .expect("failed to start embedded queue");
    TestQueue {
        queue,
        _data_dir: data_dir,
    }
}

/// Item equality under the documented test rule: every field exact, except
/// `created_at` compared on the first 29 characters of its encoded form
/// (tolerates trailing-zero normalization across encode/decode cycles).
pub fn assert_item_eq(expected: &Item, actual: &Item) {
    assert_eq!(
        expected.created_at_encoded()[..29],
        actual.created_at_encoded()[..29],
        "created_at mismatch"
    );
    assert_eq!(expected.bucket, actual.bucket, "bucket mismatch");
    assert_eq!(expected.key, actual.key, "key mismatch");
    assert_eq!(expected.value, actual.value, "value mismatch");
    assert_eq!(expected.weight, actual.weight, "weight mismatch");
    assert_eq!(expected.progress, actual.progress, "progress mismatch");
    assert_eq!(expected.canceled, actual.canceled, "canceled mismatch");
    assert_eq!(expected.error, actual.error, "error mismatch");
    assert_eq!(expected.request_id, actual.request_id, "request_id mismatch");
}

/// Receives the next event within `secs` seconds.
///
/// # Panics
///
/// Panics when no event (or closure) arrives in time.
pub async fn recv_within(sub: &mut Subscription, secs: u64) -> Option<Item> {
    tokio::time::timeout(Duration::from_secs(secs), sub.recv())
        .await
        .expect("timed out waiting for subscription event")
}

/// Asserts the subscription stays silent and open for a short grace period.
pub async fn assert_no_event(sub: &mut Subscription) {
    match tokio::time::timeout(Duration::from_millis(200), sub.recv()).await {
        Ok(Some(item)) => panic!("unexpected event: {item:?}"),
        Ok(None) => panic!("subscription unexpectedly closed"),
        Err(_) => {}
    }
}
