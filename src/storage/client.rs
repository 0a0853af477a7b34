//! The KV client handle consumed by the queue core.

use std::fmt;
use std::sync::Arc;

use super::error::StorageError;
use super::store::{KvStore, KeyValue, RangeResponse, Txn, TxnResponse, WatchStream, WatchTarget};

/// A cloneable handle to the KV store.
///
/// Safe for concurrent use from any number of tasks. Mutations (puts,
/// deletes, transactions) involve an fsync on the store's tables and run on
/// the blocking pool; reads and watch registration are served from memory.
#[derive(Clone)]
pub struct KvClient {
    store: Arc<KvStore>,
}

impl KvClient {
    pub(crate) fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Puts a key, returning the commit revision.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: Vec<u8>,
    ) -> Result<i64, StorageError> {
        let store = Arc::clone(&self.store);
        let key = key.into();
        run_blocking(move || store.put(key, value)).await
    }

    /// Reads a single key.
    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>, StorageError> {
        self.store.get(key)
    }

    /// Ascending range scan under `prefix`, returning the matching records
    /// and the revision the scan was consistent at. A `limit` of zero means
    /// unlimited.
    pub async fn get_prefix(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<RangeResponse, StorageError> {
        self.store.range(prefix, limit)
    }

    /// Deletes a key. Returns whether a record was removed.
    pub async fn delete(&self, key: impl Into<String>) -> Result<bool, StorageError> {
        let store = Arc::clone(&self.store);
        let key = key.into();
        run_blocking(move || store.delete(&key).map(|(_, deleted)| deleted)).await
    }

    /// Runs an atomic conditional transaction.
    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse, StorageError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.txn(&txn)).await
    }

    /// The current store revision.
    pub fn revision(&self) -> Result<i64, StorageError> {
        self.store.revision()
    }

    /// Registers a watch on `target` starting at `from_revision` (zero means
    /// live-only). Registration is immediate: events committed after this
    /// call returns are on the stream.
    pub fn watch(
        &self,
        target: WatchTarget,
        from_revision: i64,
    ) -> Result<WatchStream, StorageError> {
        self.store.watch(target, from_revision)
    }
}

impl fmt::Debug for KvClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvClient").finish_non_exhaustive()
    }
}

async fn run_blocking<T: Send + 'static>(
    op: impl FnOnce() -> Result<T, StorageError> + Send + 'static,
) -> Result<T, StorageError> {
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|err| StorageError::Io(err.to_string()))?
}
