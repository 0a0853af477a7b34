use thiserror::Error;

/// Errors that can occur when interacting with the KV store.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The store has been shut down; no further calls are served.
    #[error("kv store is closed")]
    Closed,

    /// A watch was requested from a revision older than the retained event
    /// log. Callers must re-read current state and re-subscribe.
    #[error("revision {requested} has been compacted (oldest retained: {oldest})")]
    Compacted {
        /// The revision the watch asked to start from.
        requested: i64,
        /// The oldest revision still present in the event log.
        oldest: i64,
    },

    /// The on-disk tables could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Failed to serialize or deserialize data.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid or unsupported configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Filesystem or network error outside the store's tables.
    #[error("io error: {0}")]
    Io(String),
}
