//! The revisioned KV engine backing the embedded server.
//!
//! A single flat keyspace with a monotonically increasing store revision.
//! Every committed mutation is stamped with the revision it committed at,
//! appended to a bounded event log, and fanned out to registered watchers.
//! Mutations are written through to redb tables first, so a store reopened
//! on the same data directory resumes with its keyspace and revision intact.
//!
//! All mutating entry points take the store lock for the full
//! evaluate-persist-apply-notify sequence; watch registration happens under
//! the same lock, which is what makes "watch from revision R+1 after a scan
//! at revision R" gapless.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::mpsc;

use super::error::StorageError;

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const META_TABLE: TableDefinition<&str, i64> = TableDefinition::new("meta");
const REVISION_KEY: &str = "revision";

/// Number of committed events retained for watch replay. Watches starting
/// below the retained window fail with [`StorageError::Compacted`].
pub const EVENT_LOG_CAPACITY: usize = 65_536;

/// A key with its current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// A committed mutation, stamped with the revision it committed at.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub revision: i64,
    pub kind: EventKind,
}

impl KvEvent {
    /// The key the event is about.
    #[must_use]
    pub fn key(&self) -> &str {
        match &self.kind {
            EventKind::Put(kv) => &kv.key,
            EventKind::Delete(key) => key,
        }
    }
}

/// What a [`KvEvent`] did.
#[derive(Debug, Clone)]
pub enum EventKind {
    Put(KeyValue),
    Delete(String),
}

/// What a watch observes: a single key or every key under a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// A guard evaluated against the keyspace before a transaction branch runs.
#[derive(Debug, Clone)]
pub enum Compare {
    /// The key holds a record.
    Exists(String),
    /// The key holds no record.
    Missing(String),
}

/// A mutation inside a transaction branch.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    #[must_use]
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// An atomic conditional multi-key transaction.
///
/// When every compare holds, the `success` ops run; otherwise the `failure`
/// ops run. Whichever branch runs commits as a whole at a single revision.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    compares: Vec<Compare>,
    success: Vec<TxnOp>,
    failure: Vec<TxnOp>,
}

impl Txn {
    #[must_use]
    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    #[must_use]
    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    #[must_use]
    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

/// The outcome of a [`Txn`].
#[derive(Debug, Clone, Copy)]
pub struct TxnResponse {
    /// Whether every compare held and the success branch ran.
    pub succeeded: bool,
    /// The store revision after the transaction.
    pub revision: i64,
}

/// The result of a range read, with the revision it was consistent at.
#[derive(Debug, Clone)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Revision-ordered event stream for one watch registration.
///
/// The stream ends (`recv` returns `None`) when the store shuts down.
/// Dropping the stream deregisters the watcher.
#[derive(Debug)]
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<KvEvent>,
}

impl WatchStream {
    /// Receives the next event, or `None` once the watch has ended.
    pub async fn recv(&mut self) -> Option<KvEvent> {
        self.rx.recv().await
    }
}

struct Watcher {
    target: WatchTarget,
    tx: mpsc::UnboundedSender<KvEvent>,
}

struct StoreInner {
    kvs: BTreeMap<String, Vec<u8>>,
    revision: i64,
    events: VecDeque<KvEvent>,
    watchers: HashMap<u64, Watcher>,
    next_watcher: u64,
    db: Option<Database>,
    closed: bool,
}

/// The embedded revisioned KV store.
pub struct KvStore {
    inner: Mutex<StoreInner>,
}

impl KvStore {
    /// Opens (or creates) a store persisted at `path`.
    ///
    /// The keyspace and revision counter reload from the on-disk tables; the
    /// event log starts empty, so watches can only begin at or after the
    /// reopened revision.
    pub fn open(path: &Path) -> Result<Arc<Self>, StorageError> {
        let db = Database::create(path).map_err(db_err)?;

        let write = db.begin_write().map_err(db_err)?;
        write.open_table(KV_TABLE).map_err(db_err)?;
        write.open_table(META_TABLE).map_err(db_err)?;
        write.commit().map_err(db_err)?;

        let read = db.begin_read().map_err(db_err)?;
        let table = read.open_table(KV_TABLE).map_err(db_err)?;
        let mut kvs = BTreeMap::new();
        for entry in table.iter().map_err(db_err)? {
            let (key, value) = entry.map_err(db_err)?;
            kvs.insert(key.value().to_string(), value.value().to_vec());
        }
        let revision = read
            .open_table(META_TABLE)
            .map_err(db_err)?
            .get(REVISION_KEY)
            .map_err(db_err)?
            .map_or(0, |guard| guard.value());

        Ok(Arc::new(Self {
            inner: Mutex::new(StoreInner {
                kvs,
                revision,
                events: VecDeque::new(),
                watchers: HashMap::new(),
                next_watcher: 0,
                db: Some(db),
                closed: false,
            }),
        }))
    }

    /// Opens a store with no on-disk tables. State is lost on drop.
    #[must_use]
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StoreInner {
                kvs: BTreeMap::new(),
                revision: 0,
                events: VecDeque::new(),
                watchers: HashMap::new(),
                next_watcher: 0,
                db: None,
                closed: false,
            }),
        })
    }

    /// Puts a key, returning the commit revision.
    pub fn put(&self, key: String, value: Vec<u8>) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let revision = inner.revision + 1;
        let event = KvEvent {
            revision,
            kind: EventKind::Put(KeyValue {
                key: key.clone(),
                value: value.clone(),
            }),
        };
        if let Some(db) = &inner.db {
            persist(db, std::slice::from_ref(&event), revision)?;
        }
        inner.revision = revision;
        inner.kvs.insert(key, value);
        inner.record(event);
        Ok(revision)
    }

    /// Reads a single key.
    pub fn get(&self, key: &str) -> Result<Option<KeyValue>, StorageError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.kvs.get(key).map(|value| KeyValue {
            key: key.to_string(),
            value: value.clone(),
        }))
    }

    /// Ascending range scan of every key under `prefix`. A `limit` of zero
    /// means unlimited.
    pub fn range(&self, prefix: &str, limit: usize) -> Result<RangeResponse, StorageError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;

        let take = if limit == 0 { usize::MAX } else { limit };
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(take)
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        Ok(RangeResponse {
            kvs,
            revision: inner.revision,
        })
    }

    /// Deletes a key. Returns the store revision and whether a record was
    /// removed; deleting an absent key does not advance the revision.
    pub fn delete(&self, key: &str) -> Result<(i64, bool), StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        if !inner.kvs.contains_key(key) {
            return Ok((inner.revision, false));
        }
        let revision = inner.revision + 1;
        let event = KvEvent {
            revision,
            kind: EventKind::Delete(key.to_string()),
        };
        if let Some(db) = &inner.db {
            persist(db, std::slice::from_ref(&event), revision)?;
        }
        inner.revision = revision;
        inner.kvs.remove(key);
        inner.record(event);
        Ok((revision, true))
    }

    /// Runs an atomic conditional transaction.
    ///
    /// The branch that runs commits as a whole at one revision; a branch
    /// whose mutations are all no-ops leaves the revision untouched.
    pub fn txn(&self, txn: &Txn) -> Result<TxnResponse, StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let succeeded = txn.compares.iter().all(|cmp| inner.check(cmp));
        let ops = if succeeded { &txn.success } else { &txn.failure };

        let revision = inner.revision + 1;
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                TxnOp::Put { key, value } => events.push(KvEvent {
                    revision,
                    kind: EventKind::Put(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    }),
                }),
                TxnOp::Delete { key } => {
                    if inner.kvs.contains_key(key) {
                        events.push(KvEvent {
                            revision,
                            kind: EventKind::Delete(key.clone()),
                        });
                    }
                }
            }
        }
        if events.is_empty() {
            return Ok(TxnResponse {
                succeeded,
                revision: inner.revision,
            });
        }

        if let Some(db) = &inner.db {
            persist(db, &events, revision)?;
        }
        inner.revision = revision;
        for event in events {
            match &event.kind {
                EventKind::Put(kv) => {
                    inner.kvs.insert(kv.key.clone(), kv.value.clone());
                }
                EventKind::Delete(key) => {
                    inner.kvs.remove(key);
                }
            }
            inner.record(event);
        }
        Ok(TxnResponse {
            succeeded,
            revision,
        })
    }

    /// Registers a watch on `target`.
    ///
    /// `from_revision == 0` means live-only: the stream carries events
    /// committed after this call. A positive revision first replays matching
    /// retained events at or after it, in revision order, with no gap before
    /// the live tail.
    pub fn watch(
        &self,
        target: WatchTarget,
        from_revision: i64,
    ) -> Result<WatchStream, StorageError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if from_revision > 0 {
            let oldest = inner
                .events
                .front()
                .map_or(inner.revision + 1, |event| event.revision);
            if from_revision < oldest && from_revision <= inner.revision {
                return Err(StorageError::Compacted {
                    requested: from_revision,
                    oldest,
                });
            }
            for event in &inner.events {
                if event.revision >= from_revision && target.matches(event.key()) {
                    let _ = tx.send(event.clone());
                }
            }
        }

        let id = inner.next_watcher;
        inner.next_watcher += 1;
        inner.watchers.insert(id, Watcher { target, tx });
        Ok(WatchStream { rx })
    }

    /// The current store revision.
    pub fn revision(&self) -> Result<i64, StorageError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        Ok(inner.revision)
    }

    /// Shuts the store down: all pending watch streams end, later calls
    /// return [`StorageError::Closed`], and the on-disk tables are released.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.watchers.clear();
        inner.db.take();
    }
}

impl StoreInner {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn check(&self, cmp: &Compare) -> bool {
        match cmp {
            Compare::Exists(key) => self.kvs.contains_key(key),
            Compare::Missing(key) => !self.kvs.contains_key(key),
        }
    }

    /// Appends to the event log and fans out to matching watchers. A watcher
    /// whose stream was dropped is pruned on the next matching event.
    fn record(&mut self, event: KvEvent) {
        self.events.push_back(event.clone());
        if self.events.len() > EVENT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.watchers.retain(|_, watcher| {
            if !watcher.target.matches(event.key()) {
                return true;
            }
            watcher.tx.send(event.clone()).is_ok()
        });
    }
}

fn persist(db: &Database, events: &[KvEvent], revision: i64) -> Result<(), StorageError> {
    let write = db.begin_write().map_err(db_err)?;
    {
        let mut table = write.open_table(KV_TABLE).map_err(db_err)?;
        for event in events {
            match &event.kind {
                EventKind::Put(kv) => {
                    table.insert(kv.key.as_str(), kv.value.as_slice()).map_err(db_err)?;
                }
                EventKind::Delete(key) => {
                    table.remove(key.as_str()).map_err(db_err)?;
                }
            }
        }
        let mut meta = write.open_table(META_TABLE).map_err(db_err)?;
        meta.insert(REVISION_KEY, revision).map_err(db_err)?;
    }
    write.commit().map_err(db_err)
}

fn db_err(err: impl std::fmt::Display) -> StorageError {
    StorageError::Persistence(err.to_string())
}
