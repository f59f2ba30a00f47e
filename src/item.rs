use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::item_key;

/// Maximum value for item weights. Weights above this clamp silently.
pub const MAX_WEIGHT: u64 = 99_999;

/// Progress value of a finished item.
pub const MAX_PROGRESS: u8 = 100;

/// A job item in the queue. `key` is stored as the KV key, with the
/// serialized JSON item as the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Name or job category used for namespacing. All keys of this item
    /// are prefixed with the bucket name.
    pub bucket: String,

    /// Timestamp of item creation.
    pub created_at: DateTime<Utc>,

    /// Derived from bucket, weight, and creation time so that
    /// lexicographic order on keys equals queue order.
    pub key: String,

    /// Opaque payload, e.g. encoded request or result data.
    pub value: String,

    /// Progress status in `[0, MAX_PROGRESS]`.
    pub progress: u8,

    /// True once the item was removed from the queue before reaching
    /// terminal progress. Set by the engine, never by clients.
    #[serde(default)]
    pub canceled: bool,

    /// Error message; empty means no error. Kept as a plain string so
    /// clients in other languages can interpolate it.
    #[serde(default)]
    pub error: String,

    /// Correlation id generated by external services.
    #[serde(default)]
    pub request_id: String,
}

/// First differing field found by [`Item::matches`].
#[derive(Debug, Error)]
#[error("expected {field} {expected:?}, got {got:?}")]
pub struct ItemMismatch {
    pub field: &'static str,
    pub expected: String,
    pub got: String,
}

fn mismatch(field: &'static str, expected: impl ToString, got: impl ToString) -> ItemMismatch {
    ItemMismatch {
        field,
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

impl Item {
    /// Create a new item keyed by bucket, weight, and the current time.
    /// Weights above [`MAX_WEIGHT`] clamp silently.
    pub fn create(bucket: impl Into<String>, weight: u64, value: impl Into<String>) -> Self {
        let bucket = bucket.into();
        let created_at = Utc::now();
        // In range until 2262.
        let nanos = created_at.timestamp_nanos_opt().unwrap_or_default();
        let key = item_key(&bucket, weight, nanos);
        Self {
            bucket,
            created_at,
            key,
            value: value.into(),
            progress: 0,
            canceled: false,
            error: String::new(),
            request_id: String::new(),
        }
    }

    /// A synthetic item carrying only an error, emitted on update streams
    /// when an operation cannot produce a real item.
    pub(crate) fn errored(error: impl Into<String>) -> Self {
        Self {
            bucket: String::new(),
            created_at: Utc::now(),
            key: String::new(),
            value: String::new(),
            progress: 0,
            canceled: false,
            error: error.into(),
            request_id: String::new(),
        }
    }

    /// Canonical textual form of the creation time, truncated to the 29
    /// characters that survive serialization round-trips.
    pub fn created_at_prefix(&self) -> String {
        let repr = self.created_at.format("%Y-%m-%d %H:%M:%S%.9f").to_string();
        repr.chars().take(29).collect()
    }

    /// Compare two items field by field. Creation times compare equal when
    /// their canonical 29-character prefixes match, tolerating rounding
    /// introduced by serialization.
    pub fn matches(&self, other: &Item) -> Result<(), ItemMismatch> {
        if self.created_at_prefix() != other.created_at_prefix() {
            return Err(mismatch(
                "created_at",
                self.created_at_prefix(),
                other.created_at_prefix(),
            ));
        }
        if self.bucket != other.bucket {
            return Err(mismatch("bucket", &self.bucket, &other.bucket));
        }
        if self.key != other.key {
            return Err(mismatch("key", &self.key, &other.key));
        }
        if self.value != other.value {
            return Err(mismatch("value", &self.value, &other.value));
        }
        if self.progress != other.progress {
            return Err(mismatch("progress", self.progress, other.progress));
        }
        if self.canceled != other.canceled {
            return Err(mismatch("canceled", self.canceled, other.canceled));
        }
        if self.error != other.error {
            return Err(mismatch("error", &self.error, &other.error));
        }
        if self.request_id != other.request_id {
            return Err(mismatch("request_id", &self.request_id, &other.request_id));
        }
        Ok(())
    }
}
