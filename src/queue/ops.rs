//! Queue operations implementation.

use std::future::Future;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::models::Item;
use crate::storage::{
    Compare, EmbeddedServer, KvClient, ServerConfig, StorageError, Txn, TxnOp,
};

use super::config::QueueConfig;
use super::error::QueueError;
use super::sub::{SubKind, Subscription, SubscriptionEngine};

/// The main queue interface.
///
/// Every cross-key invariant is enforced by conditional KV transactions, not
/// in-process locks: the same store may be addressed by other clients
/// through [`client`](Self::client), so a pending record and a completed
/// record for one key can never coexist regardless of who writes.
///
/// All public operations accept a cancellation token; a fired token aborts
/// the in-flight KV call, tears down any watch the operation started, and
/// closes the subscription the operation returned. [`stop`](Self::stop)
/// cancels the root of the token tree, so no engine task outlives the queue.
pub struct Queue {
    client: KvClient,
    config: QueueConfig,
    engine: SubscriptionEngine,
    root: CancellationToken,
    server: Option<EmbeddedServer>,
}

impl Queue {
    /// Creates a queue over an already-configured KV client with the default
    /// key prefixes.
    #[must_use]
    pub fn new(client: KvClient) -> Self {
        Self::with_config(client, QueueConfig::default())
    }

    /// Creates a queue over an already-configured KV client.
    #[must_use]
    pub fn with_config(client: KvClient, config: QueueConfig) -> Self {
        let root = CancellationToken::new();
        let engine = SubscriptionEngine::new(client.clone(), config.clone(), root.clone());
        Self {
            client,
            config,
            engine,
            root,
            server: None,
        }
    }

    /// Starts an embedded server and creates a queue over it.
    ///
    /// The server is owned by the queue and shut down by [`stop`](Self::stop).
    pub async fn embedded(config: ServerConfig) -> Result<Self, QueueError> {
        let server = EmbeddedServer::start(config).await?;
        let mut queue = Self::new(server.client());
        queue.server = Some(server);
        Ok(queue)
    }

    /// Creates an item whose key lives under this queue's pending prefix.
    ///
    /// Equivalent to [`Item::new`] for queues with the default prefixes.
    #[must_use]
    pub fn create_item(
        &self,
        bucket: impl Into<String>,
        weight: u16,
        value: impl Into<String>,
    ) -> Item {
        Item::with_prefix(&self.config.pending_prefix, bucket, weight, value)
    }

    /// Atomically materializes the item's current state in the store and
    /// returns a subscription that delivers at most one update (the terminal
    /// one) and then closes.
    ///
    /// `progress > 100` is clamped to 100; an item with `progress == 100`, a
    /// non-empty `error`, or `canceled` set goes straight to the completed
    /// prefix (the pending record, if any, is deleted in the same
    /// transaction). Anything else is written under its pending key,
    /// overwriting a previous pending record in place. Note that the pending
    /// key embeds the creation-time weight: re-enqueueing with a different
    /// `weight` rewrites the record under the old key and does not change
    /// its priority; dequeue and re-create to re-prioritize.
    ///
    /// Returns only after the transaction has committed, so a subsequent
    /// [`front`](Self::front) from any task observes the item.
    ///
    /// # Errors
    ///
    /// * `QueueError::TerminalState` - the key already holds a completed
    ///   record; terminal states are immutable and the store is unchanged.
    /// * `QueueError::Canceled` - the token fired or the queue was stopped.
    /// * `QueueError::Storage` - the KV call failed.
    pub async fn enqueue(
        &self,
        token: &CancellationToken,
        mut item: Item,
    ) -> Result<Subscription, QueueError> {
        self.ensure_running()?;
        if item.progress > 100 {
            item.progress = 100;
        }
        let body = serde_json::to_vec(&item)?;
        let completed_key = self.config.completed_key_for(&item.key);

        // Subscribe before the transaction: the commit's own events must
        // reach this subscription.
        let sub = self
            .engine
            .subscribe_item(&item.key, SubKind::Terminal, token)?;

        let txn = if item.is_completed() {
            Txn::default()
                .when([Compare::Missing(completed_key.clone())])
                .and_then([
                    TxnOp::delete(item.key.clone()),
                    TxnOp::put(completed_key, body),
                ])
        } else {
            Txn::default()
                .when([Compare::Missing(completed_key)])
                .and_then([TxnOp::put(item.key.clone(), body)])
        };

        match self.run(token, self.client.txn(txn)).await {
            Ok(resp) if resp.succeeded => {
                counter!("revq.items.enqueued", "bucket" => item.bucket.clone()).increment(1);
                Ok(sub)
            }
            Ok(_) => {
                drop(sub);
                Err(QueueError::TerminalState {
                    key: item.key.clone(),
                })
            }
            Err(err) => {
                drop(sub);
                Err(err)
            }
        }
    }

    /// Cancels a pending item.
    ///
    /// When a pending record for the item's key exists, one transaction
    /// deletes it and writes a completed record with `canceled` set; every
    /// subscription on the key then receives the canceled item and closes.
    /// When no pending record exists the call is a no-op and still succeeds
    /// (idempotent on items that are already terminal or were never
    /// enqueued).
    ///
    /// # Errors
    ///
    /// * `QueueError::Canceled` - the token fired or the queue was stopped.
    /// * `QueueError::Storage` - the KV call failed.
    pub async fn dequeue(&self, token: &CancellationToken, item: &Item) -> Result<(), QueueError> {
        self.ensure_running()?;
        let mut canceled = item.clone();
        canceled.canceled = true;
        let body = serde_json::to_vec(&canceled)?;
        let completed_key = self.config.completed_key_for(&item.key);

        let txn = Txn::default()
            .when([Compare::Exists(item.key.clone())])
            .and_then([
                TxnOp::delete(item.key.clone()),
                TxnOp::put(completed_key, body),
            ]);

        let resp = self.run(token, self.client.txn(txn)).await?;
        if resp.succeeded {
            counter!("revq.items.canceled", "bucket" => item.bucket.clone()).increment(1);
        } else {
            tracing::debug!(key = %item.key, "dequeue of non-pending item is a no-op");
        }
        Ok(())
    }

    /// Returns a subscription delivering the bucket's current head and, from
    /// then on, the new head whenever it changes.
    ///
    /// The channel does not close on head transitions; it closes when the
    /// token fires or the queue stops. A head the subscriber has not drained
    /// is not replaced.
    ///
    /// # Errors
    ///
    /// * `QueueError::Canceled` - the queue was stopped.
    pub fn front(
        &self,
        token: &CancellationToken,
        bucket: &str,
    ) -> Result<Subscription, QueueError> {
        self.ensure_running()?;
        self.engine.subscribe_head(bucket, token)
    }

    /// Returns a subscription delivering every update to the item, pending
    /// rewrites included, from the revision current at subscription time.
    ///
    /// Events prior to subscription are not replayed; install the observer
    /// after the item exists in the store. The channel closes after the
    /// terminal event or when the token fires.
    ///
    /// # Errors
    ///
    /// * `QueueError::Canceled` - the queue was stopped.
    /// * `QueueError::Storage` - the KV watch could not be registered.
    pub fn watch(
        &self,
        token: &CancellationToken,
        item_key: &str,
    ) -> Result<Subscription, QueueError> {
        self.ensure_running()?;
        self.engine.subscribe_item(item_key, SubKind::Observer, token)
    }

    /// Returns the underlying KV client handle.
    #[must_use]
    pub const fn client(&self) -> &KvClient {
        &self.client
    }

    /// Returns the queue configuration.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The embedded server's client endpoint URLs, in order. Empty for
    /// queues built over an external client.
    #[must_use]
    pub fn client_endpoints(&self) -> &[String] {
        self.server
            .as_ref()
            .map_or(&[], |server| server.client_endpoints())
    }

    /// Stops the queue: cancels the root token, closes every active
    /// subscription, and shuts down the embedded server when one is owned.
    ///
    /// Idempotent. Operations invoked after `stop` return
    /// `QueueError::Canceled`; in-flight operations either complete or
    /// return the same.
    pub async fn stop(&self) {
        if self.root.is_cancelled() {
            return;
        }
        self.root.cancel();
        self.engine.shutdown();
        if let Some(server) = &self.server {
            server.stop().await;
        }
        tracing::info!("queue stopped");
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        if self.root.is_cancelled() {
            return Err(QueueError::Canceled);
        }
        Ok(())
    }

    /// Races a KV call against the caller's token and the queue lifetime.
    async fn run<T>(
        &self,
        token: &CancellationToken,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, QueueError> {
        tokio::select! {
            () = token.cancelled() => Err(QueueError::Canceled),
            () = self.root.cancelled() => Err(QueueError::Canceled),
            result = call => result.map_err(QueueError::from),
        }
    }
}
