//! Storage layer: the revisioned KV engine, the client handle the queue
//! consumes, and the embedded server lifecycle.

pub mod client;
pub mod error;
pub mod server;
pub mod store;

pub use client::KvClient;
pub use error::StorageError;
pub use server::{EmbeddedServer, ServerConfig};
pub use store::{
    Compare, EventKind, KeyValue, KvEvent, KvStore, RangeResponse, Txn, TxnOp, TxnResponse,
    WatchStream, WatchTarget,
};
