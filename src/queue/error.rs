//! Error types for queue operations.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur during queue operations.
///
/// The queue performs no internal retries: storage failures and
/// cancellations surface to the caller, and subscriptions torn down by a
/// failed watch must be re-established by re-subscribing.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The operation's cancellation token fired, or the queue was stopped.
    #[error("operation canceled")]
    Canceled,

    /// The item's key already holds a completed record. Terminal states are
    /// immutable; the store was left unchanged.
    #[error("item {key} is already in a terminal state")]
    TerminalState {
        /// The pending key of the rejected item.
        key: String,
    },

    /// The KV store call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The item could not be encoded for storage.
    #[error("item codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
