//! revq - durable priority job queue over a revisioned key-value store
//!
//! A priority queue encoded as keys: each pending item lives under
//! `queue/pending/<bucket>/<inverted weight>/<created_at>/<suffix>`, so a
//! lexicographic ascending range scan yields the bucket's highest-priority
//! item with no in-memory index. Completed items move atomically to
//! `queue/completed/`: one conditional transaction guarantees the two
//! prefixes are never populated for the same key at once. Lifecycle changes
//! flow from revision-ordered KV watches onto per-subscriber channels that
//! close on terminal states.
//!
//! ```no_run
//! use revq::{Item, Queue, ServerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), revq::QueueError> {
//! let queue = Queue::embedded(ServerConfig::new(0, 0, "./data")).await?;
//! let token = CancellationToken::new();
//!
//! // Producer: enqueue and wait for the terminal update.
//! let mut done = queue
//!     .enqueue(&token, Item::new("emails", 9000, "payload"))
//!     .await?;
//!
//! // Consumer: take the bucket head, do the work, report completion.
//! let mut head = queue.front(&token, "emails")?;
//! if let Some(mut item) = head.recv().await {
//!     item.progress = 100;
//!     queue.enqueue(&token, item).await?;
//! }
//!
//! assert!(done.recv().await.is_some_and(|item| item.is_completed()));
//! queue.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod models;
pub mod queue;
pub mod storage;

pub use models::{Item, MAX_WEIGHT, PFX_COMPLETED, PFX_PENDING};
pub use queue::{Queue, QueueConfig, QueueError, Subscription};
pub use storage::{EmbeddedServer, KvClient, ServerConfig, StorageError};
