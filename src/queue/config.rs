//! Queue configuration: the key prefixes partitioning the keyspace.

use crate::models::keys;

/// Queue configuration.
///
/// The two prefixes must be disjoint: a pending key must never parse as a
/// completed key or vice versa.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Prefix under which pending records live.
    pub pending_prefix: String,
    /// Prefix under which completed records live.
    pub completed_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pending_prefix: keys::PFX_PENDING.to_string(),
            completed_prefix: keys::PFX_COMPLETED.to_string(),
        }
    }
}

impl QueueConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if either prefix is empty, does not end with `/`, or
    /// one prefix is a prefix of the other.
    pub fn validate(&self) -> Result<(), String> {
        for (name, prefix) in [
            ("pending_prefix", &self.pending_prefix),
            ("completed_prefix", &self.completed_prefix),
        ] {
            if prefix.is_empty() {
                return Err(format!("{name} must not be empty"));
            }
            if !prefix.ends_with('/') {
                return Err(format!("{name} must end with '/', got {prefix:?}"));
            }
        }
        if self.pending_prefix.starts_with(&self.completed_prefix)
            || self.completed_prefix.starts_with(&self.pending_prefix)
        {
            return Err(format!(
                "prefixes must be disjoint, got {:?} and {:?}",
                self.pending_prefix, self.completed_prefix
            ));
        }
        Ok(())
    }

    /// The range prefix covering every pending key of `bucket`.
    #[must_use]
    pub fn bucket_prefix(&self, bucket: &str) -> String {
        keys::bucket_prefix(&self.pending_prefix, bucket)
    }

    /// Derives the completed key for a pending key.
    #[must_use]
    pub fn completed_key_for(&self, pending_key: &str) -> String {
        keys::completed_key(&self.pending_prefix, &self.completed_prefix, pending_key)
    }
}
