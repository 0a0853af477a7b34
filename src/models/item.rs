//! The item record: the unit of work carried by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keys;

/// An item in the queue.
///
/// Items are JSON documents stored under either the pending or the completed
/// key prefix, never both. The `key` is derived from `bucket`, `weight`,
/// `created_at` and a creation-time random suffix (see [`keys`]); once
/// assigned it never changes, even when `value` or `progress` are rewritten
/// in place. `created_at` and `request_id` are likewise immutable after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Logical queue partition. All ordering is scoped to one bucket.
    pub bucket: String,

    /// Creation timestamp, UTC, nanosecond precision. Encoded as RFC 3339
    /// with nine fractional digits so encode/decode cycles are byte-stable.
    #[serde(with = "rfc3339_nanos")]
    pub created_at: DateTime<Utc>,

    /// Derived pending-key identifier.
    pub key: String,

    /// Opaque payload.
    pub value: String,

    /// Priority. Higher weight is delivered first.
    pub weight: u16,

    /// Consumer-reported progress, 0..100. 100 means done.
    pub progress: i64,

    /// Set only by `Queue::dequeue`. Terminal.
    pub canceled: bool,

    /// Non-empty indicates failure. Terminal.
    pub error: String,

    /// Opaque correlation token, preserved across updates.
    pub request_id: String,
}

impl Item {
    /// Creates a new item with a fresh key and request id.
    ///
    /// No storage interaction happens here; the item becomes pending on its
    /// first enqueue. Uses the default key prefixes; queues configured with
    /// custom prefixes create items through `Queue::create_item`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, weight: u16, value: impl Into<String>) -> Self {
        Self::with_prefix(keys::PFX_PENDING, bucket, weight, value)
    }

    /// Creates a new item whose key lives under the given pending prefix.
    #[must_use]
    pub fn with_prefix(
        pending_prefix: &str,
        bucket: impl Into<String>,
        weight: u16,
        value: impl Into<String>,
    ) -> Self {
        let bucket = bucket.into();
        let created_at = Utc::now();
        let suffix = keys::random_suffix();
        let key = keys::pending_key(pending_prefix, &bucket, weight, &created_at, &suffix);

        Self {
            bucket,
            created_at,
            key,
            value: value.into(),
            weight,
            progress: 0,
            canceled: false,
            error: String::new(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Whether the item is in a terminal state.
    ///
    /// Terminal items live under the completed prefix only and admit no
    /// further transitions.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.progress >= 100 || !self.error.is_empty() || self.canceled
    }

    /// `created_at` in the canonical encoded form.
    #[must_use]
    pub fn created_at_encoded(&self) -> String {
        keys::format_created_at(&self.created_at)
    }
}

mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
