//! Subscription engine: translates KV watch streams into per-item and
//! per-bucket lifecycle channels.
//!
//! Subscriptions live in an arena keyed by opaque ids; the receiving side
//! holds its id and deregisters through it, never through a back-pointer.
//! The engine runs one fan-out task per distinct watch target:
//!
//! - a per-item target watches the item's pending and completed keys.
//!   Pending-key puts are in-progress updates, routed to observer
//!   subscriptions only. A completed-key put is the terminal event: it is
//!   routed to every subscription on the key, which are then removed and
//!   closed. Pending-key deletes are the move half of a completion
//!   transaction and carry no information of their own.
//! - a per-bucket head target scans the bucket's pending range (limit 1,
//!   ascending) and then watches the range from the scan revision + 1,
//!   re-scanning on every event and delivering the head when it changed.
//!
//! Per-item channels are a capacity-one slot with overwrite: a slow reader
//! loses intermediate progress updates but always observes the terminal
//! event before the channel closes. Head channels are capacity-one with
//! drop-when-full: an undrained head is not replaced.
//!
//! The registry mutex is held only for map surgery and non-blocking sends.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::models::Item;
use crate::storage::{EventKind, KvClient, WatchStream, WatchTarget};

use super::config::QueueConfig;
use super::error::QueueError;

/// A stream of item updates delivered to one subscriber.
///
/// `recv` returns `None` once the subscription is closed: after the terminal
/// event for enqueue and observer subscriptions, or on cancellation for head
/// subscriptions. Dropping a subscription deregisters it without disturbing
/// other subscriptions on the same target.
pub struct Subscription {
    id: u64,
    engine: Arc<EngineShared>,
    rx: SubReceiver,
}

enum SubReceiver {
    Slot(watch::Receiver<Option<Item>>),
    Chan(mpsc::Receiver<Item>),
}

impl Subscription {
    /// Receives the next item update, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Item> {
        match &mut self.rx {
            SubReceiver::Slot(rx) => {
                rx.changed().await.ok()?;
                rx.borrow_and_update().clone()
            }
            SubReceiver::Chan(rx) => rx.recv().await,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.engine.deregister(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// What a per-item subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubKind {
    /// Only the terminal event (enqueue subscriptions).
    Terminal,
    /// Every update, terminal included (watch subscriptions).
    Observer,
    /// Rolling bucket head (front subscriptions).
    Head,
}

enum SubSender {
    Slot(watch::Sender<Option<Item>>),
    Chan(mpsc::Sender<Item>),
}

enum TargetRef {
    Item(String),
    Head(String),
}

struct SubEntry {
    sender: SubSender,
    kind: SubKind,
    /// Store revision at registration time. Per-item subscriptions only see
    /// events committed after it; events prior to subscription are never
    /// replayed.
    from_revision: i64,
    done: CancellationToken,
    target: TargetRef,
}

struct ItemTarget {
    sub_ids: Vec<u64>,
    stop: CancellationToken,
}

struct HeadTarget {
    sub_ids: Vec<u64>,
    stop: CancellationToken,
    last_head: Option<Item>,
}

#[derive(Default)]
struct EngineInner {
    next_id: u64,
    subs: HashMap<u64, SubEntry>,
    items: HashMap<String, ItemTarget>,
    heads: HashMap<String, HeadTarget>,
    shutdown: bool,
}

pub(crate) struct SubscriptionEngine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    client: KvClient,
    config: QueueConfig,
    root: CancellationToken,
    inner: Mutex<EngineInner>,
}

impl SubscriptionEngine {
    pub(crate) fn new(client: KvClient, config: QueueConfig, root: CancellationToken) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                client,
                config,
                root,
                inner: Mutex::new(EngineInner::default()),
            }),
        }
    }

    /// Registers a per-item subscription and ensures the key's fan-out task
    /// is running.
    ///
    /// The underlying KV watches are registered before this returns, so a
    /// mutation committed after the call cannot be missed; enqueue relies
    /// on this by subscribing before it runs its transaction.
    pub(crate) fn subscribe_item(
        &self,
        key: &str,
        kind: SubKind,
        caller: &CancellationToken,
    ) -> Result<Subscription, QueueError> {
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.inner.lock();
        if inner.shutdown {
            return Err(QueueError::Canceled);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let from_revision = shared.client.revision()?;
        let (tx, rx) = watch::channel(None);
        let done = CancellationToken::new();

        {
            let target = match inner.items.entry(key.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    // Watch from the registration revision + 1: an event
                    // committing while the watches are being installed is
                    // replayed instead of lost.
                    let pending = shared
                        .client
                        .watch(WatchTarget::Key(key.to_string()), from_revision + 1)?;
                    let completed = shared.client.watch(
                        WatchTarget::Key(shared.config.completed_key_for(key)),
                        from_revision + 1,
                    )?;
                    let stop = shared.root.child_token();
                    tokio::spawn(item_fanout(
                        Arc::clone(&shared),
                        key.to_string(),
                        pending,
                        completed,
                        stop.clone(),
                    ));
                    entry.insert(ItemTarget {
                        sub_ids: Vec::new(),
                        stop,
                    })
                }
            };
            target.sub_ids.push(id);
        }
        inner.subs.insert(
            id,
            SubEntry {
                sender: SubSender::Slot(tx),
                kind,
                from_revision,
                done: done.clone(),
                target: TargetRef::Item(key.to_string()),
            },
        );
        drop(inner);

        spawn_caller_monitor(Arc::clone(&shared), id, done, caller.clone());
        Ok(Subscription {
            id,
            engine: shared,
            rx: SubReceiver::Slot(rx),
        })
    }

    /// Registers a per-bucket head subscription and ensures the bucket's
    /// fan-out task is running. A subscriber joining an existing target
    /// immediately receives the cached head.
    pub(crate) fn subscribe_head(
        &self,
        bucket: &str,
        caller: &CancellationToken,
    ) -> Result<Subscription, QueueError> {
        let shared = Arc::clone(&self.shared);
        let mut inner = shared.inner.lock();
        if inner.shutdown {
            return Err(QueueError::Canceled);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = mpsc::channel(1);
        let done = CancellationToken::new();

        {
            let target = match inner.heads.entry(bucket.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let stop = shared.root.child_token();
                    tokio::spawn(head_fanout(
                        Arc::clone(&shared),
                        bucket.to_string(),
                        stop.clone(),
                    ));
                    entry.insert(HeadTarget {
                        sub_ids: Vec::new(),
                        stop,
                        last_head: None,
                    })
                }
            };
            target.sub_ids.push(id);
            if let Some(item) = &target.last_head {
                let _ = tx.try_send(item.clone());
            }
        }
        inner.subs.insert(
            id,
            SubEntry {
                sender: SubSender::Chan(tx),
                kind: SubKind::Head,
                from_revision: 0,
                done: done.clone(),
                target: TargetRef::Head(bucket.to_string()),
            },
        );
        drop(inner);

        spawn_caller_monitor(Arc::clone(&shared), id, done, caller.clone());
        Ok(Subscription {
            id,
            engine: shared,
            rx: SubReceiver::Chan(rx),
        })
    }

    /// Closes every subscription and rejects further registrations. Fan-out
    /// tasks observe their cancelled stop tokens and exit.
    pub(crate) fn shutdown(&self) {
        let mut inner = self.shared.inner.lock();
        inner.shutdown = true;
        for (_, target) in inner.items.drain() {
            target.stop.cancel();
        }
        for (_, target) in inner.heads.drain() {
            target.stop.cancel();
        }
        for (_, entry) in inner.subs.drain() {
            entry.done.cancel();
        }
    }
}

impl EngineShared {
    /// Removes one subscription by id. When it was the target's last
    /// subscription, the target's fan-out task is stopped as well.
    fn deregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.subs.remove(&id) else {
            return;
        };
        entry.done.cancel();
        match &entry.target {
            TargetRef::Item(key) => {
                let emptied = match inner.items.get_mut(key) {
                    Some(target) => {
                        target.sub_ids.retain(|sub| *sub != id);
                        target.sub_ids.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    if let Some(target) = inner.items.remove(key) {
                        target.stop.cancel();
                    }
                }
            }
            TargetRef::Head(bucket) => {
                let emptied = match inner.heads.get_mut(bucket) {
                    Some(target) => {
                        target.sub_ids.retain(|sub| *sub != id);
                        target.sub_ids.is_empty()
                    }
                    None => false,
                };
                if emptied {
                    if let Some(target) = inner.heads.remove(bucket) {
                        target.stop.cancel();
                    }
                }
            }
        }
    }

    /// Routes an in-progress update to the key's observer subscriptions
    /// installed before the event committed.
    fn route_item_update(&self, key: &str, revision: i64, value: &[u8]) {
        let Some(item) = decode_item(key, value) else {
            return;
        };
        let inner = self.inner.lock();
        let Some(target) = inner.items.get(key) else {
            return;
        };
        for id in &target.sub_ids {
            if let Some(entry) = inner.subs.get(id) {
                if entry.kind == SubKind::Observer && entry.from_revision < revision {
                    if let SubSender::Slot(tx) = &entry.sender {
                        tx.send_replace(Some(item.clone()));
                    }
                }
            }
        }
    }

    /// Routes the terminal event to every subscription on the key installed
    /// before it committed, removes and closes them, and retires the target.
    /// A subscription installed at or after the terminal revision keeps its
    /// channel open until its own token fires: the event predates it.
    fn route_item_terminal(&self, key: &str, revision: i64, value: &[u8]) {
        let Some(item) = decode_item(key, value) else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some(target) = inner.items.remove(key) else {
            return;
        };
        target.stop.cancel();
        for id in target.sub_ids {
            let delivered = inner
                .subs
                .get(&id)
                .is_some_and(|entry| entry.from_revision < revision);
            if !delivered {
                continue;
            }
            if let Some(entry) = inner.subs.remove(&id) {
                entry.done.cancel();
                if let SubSender::Slot(tx) = &entry.sender {
                    tx.send_replace(Some(item.clone()));
                }
            }
        }
    }

    /// Closes every subscription on an item target without an event (watch
    /// stream ended or the target was cancelled). Idempotent.
    fn remove_item_target(&self, key: &str) {
        let mut inner = self.inner.lock();
        let Some(target) = inner.items.remove(key) else {
            return;
        };
        target.stop.cancel();
        for id in target.sub_ids {
            if let Some(entry) = inner.subs.remove(&id) {
                entry.done.cancel();
            }
        }
    }

    /// Records the bucket's current head and delivers it to head
    /// subscriptions when it differs from the last delivered one. A drained
    /// bucket clears the cache but delivers nothing.
    fn deliver_head(&self, bucket: &str, head: Option<Item>) {
        let mut inner = self.inner.lock();
        let delivery = {
            let Some(target) = inner.heads.get_mut(bucket) else {
                return;
            };
            if target.last_head == head {
                return;
            }
            target.last_head.clone_from(&head);
            head.map(|item| (item, target.sub_ids.clone()))
        };
        let Some((item, ids)) = delivery else {
            return;
        };
        for id in ids {
            if let Some(entry) = inner.subs.get(&id) {
                if let SubSender::Chan(tx) = &entry.sender {
                    let _ = tx.try_send(item.clone());
                }
            }
        }
    }

    /// Closes every subscription on a head target. Idempotent.
    fn remove_head_target(&self, bucket: &str) {
        let mut inner = self.inner.lock();
        let Some(target) = inner.heads.remove(bucket) else {
            return;
        };
        target.stop.cancel();
        for id in target.sub_ids {
            if let Some(entry) = inner.subs.remove(&id) {
                entry.done.cancel();
            }
        }
    }
}

/// Fan-out task for one item key: watches the pending and completed keys and
/// routes decoded events until the terminal event, cancellation, or the end
/// of a watch stream.
async fn item_fanout(
    shared: Arc<EngineShared>,
    key: String,
    mut pending: WatchStream,
    mut completed: WatchStream,
    stop: CancellationToken,
) {
    tracing::debug!(key = %key, "item fan-out started");
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            event = pending.recv() => match event {
                Some(event) => {
                    if let EventKind::Put(kv) = &event.kind {
                        shared.route_item_update(&key, event.revision, &kv.value);
                    }
                }
                None => break,
            },
            event = completed.recv() => match event {
                Some(event) => {
                    if let EventKind::Put(kv) = &event.kind {
                        shared.route_item_terminal(&key, event.revision, &kv.value);
                        tracing::debug!(key = %key, "item fan-out finished");
                        return;
                    }
                }
                None => break,
            },
        }
    }
    shared.remove_item_target(&key);
    tracing::debug!(key = %key, "item fan-out stopped");
}

/// Fan-out task for one bucket head: scans once, watches the pending range
/// from the scan revision + 1, and re-scans on every event.
async fn head_fanout(shared: Arc<EngineShared>, bucket: String, stop: CancellationToken) {
    let prefix = shared.config.bucket_prefix(&bucket);
    tracing::debug!(bucket = %bucket, "head fan-out started");

    let scan = tokio::select! {
        () = stop.cancelled() => {
            shared.remove_head_target(&bucket);
            return;
        }
        resp = shared.client.get_prefix(&prefix, 1) => resp,
    };
    let resp = match scan {
        Ok(resp) => resp,
        Err(err) => {
            tracing::warn!(bucket = %bucket, error = %err, "head scan failed");
            shared.remove_head_target(&bucket);
            return;
        }
    };
    let mut stream = match shared
        .client
        .watch(WatchTarget::Prefix(prefix.clone()), resp.revision + 1)
    {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(bucket = %bucket, error = %err, "head watch failed");
            shared.remove_head_target(&bucket);
            return;
        }
    };
    let head = resp
        .kvs
        .first()
        .and_then(|kv| decode_item(&kv.key, &kv.value));
    shared.deliver_head(&bucket, head);

    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            event = stream.recv() => {
                if event.is_none() {
                    break;
                }
                match shared.client.get_prefix(&prefix, 1).await {
                    Ok(resp) => {
                        let head = resp
                            .kvs
                            .first()
                            .and_then(|kv| decode_item(&kv.key, &kv.value));
                        shared.deliver_head(&bucket, head);
                    }
                    Err(err) => {
                        tracing::warn!(bucket = %bucket, error = %err, "head re-scan failed");
                        break;
                    }
                }
            }
        }
    }
    shared.remove_head_target(&bucket);
    tracing::debug!(bucket = %bucket, "head fan-out stopped");
}

/// Closes the subscription when the caller's token fires first.
fn spawn_caller_monitor(
    shared: Arc<EngineShared>,
    id: u64,
    done: CancellationToken,
    caller: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            () = caller.cancelled() => shared.deregister(id),
            () = done.cancelled() => {}
        }
    });
}

fn decode_item(key: &str, value: &[u8]) -> Option<Item> {
    match serde_json::from_slice(value) {
        Ok(item) => Some(item),
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "dropping undecodable item event");
            None
        }
    }
}
