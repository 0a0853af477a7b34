//! Key codec for the pending and completed keyspaces.
//!
//! Priority ordering is encoded into the pending key itself so that a plain
//! lexicographic ascending range scan yields the highest-priority item first:
//!
//! ```text
//! queue/pending/<bucket>/<65535 - weight, zero-padded>/<created_at>/<rand8>
//! ```
//!
//! Subtracting the weight from [`MAX_WEIGHT`] inverts the sort (higher weight
//! sorts earlier); the RFC 3339 timestamp breaks weight ties FIFO; the random
//! suffix disambiguates items created in the same nanosecond. The completed
//! key for an item is the pending key with the prefix substituted.

use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Default prefix for pending records.
pub const PFX_PENDING: &str = "queue/pending/";

/// Default prefix for completed records.
pub const PFX_COMPLETED: &str = "queue/completed/";

/// Maximum item weight. Weights are inverted against this bound when encoded
/// into pending keys.
pub const MAX_WEIGHT: u16 = u16::MAX;

/// Length of the random alphanumeric key suffix.
pub const SUFFIX_LEN: usize = 8;

/// Builds the pending key for an item.
#[must_use]
pub fn pending_key(
    pending_prefix: &str,
    bucket: &str,
    weight: u16,
    created_at: &DateTime<Utc>,
    suffix: &str,
) -> String {
    format!(
        "{pending_prefix}{bucket}/{:05}/{}/{suffix}",
        MAX_WEIGHT - weight,
        format_created_at(created_at),
    )
}

/// Derives the completed key from a pending key by prefix substitution.
#[must_use]
pub fn completed_key(pending_prefix: &str, completed_prefix: &str, pending_key: &str) -> String {
    pending_key.replacen(pending_prefix, completed_prefix, 1)
}

/// Returns the range prefix covering every pending key of a bucket.
#[must_use]
pub fn bucket_prefix(pending_prefix: &str, bucket: &str) -> String {
    format!("{pending_prefix}{bucket}/")
}

/// Encodes a timestamp the way keys and item records carry it: RFC 3339 in
/// UTC with the fractional seconds forced to nine digits, so encode/decode
/// cycles are byte-stable.
#[must_use]
pub fn format_created_at(created_at: &DateTime<Utc>) -> String {
    created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Generates a fresh [`SUFFIX_LEN`]-character alphanumeric suffix.
#[must_use]
pub fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// The components of a parsed pending key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParts {
    pub bucket: String,
    pub weight: u16,
    pub created_at: DateTime<Utc>,
    pub suffix: String,
}

/// Parses a pending key back into its components.
///
/// Returns `None` when the key does not carry the given prefix or any
/// segment fails to decode. Bucket names may themselves contain `/`; the
/// trailing three segments are fixed, everything before them is the bucket.
#[must_use]
pub fn parse(pending_prefix: &str, key: &str) -> Option<KeyParts> {
    let rest = key.strip_prefix(pending_prefix)?;

    let (rest, suffix) = rest.rsplit_once('/')?;
    let (rest, created_at) = rest.rsplit_once('/')?;
    let (bucket, inverted) = rest.rsplit_once('/')?;
    if bucket.is_empty() || suffix.len() != SUFFIX_LEN {
        return None;
    }

    let inverted: u16 = inverted.parse().ok()?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .ok()?
        .with_timezone(&Utc);

    Some(KeyParts {
        bucket: bucket.to_string(),
        weight: MAX_WEIGHT - inverted,
        created_at,
        suffix: suffix.to_string(),
    })
}
