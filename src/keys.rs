//! Key layout for the queue namespaces.
//!
//! The KV store holds exactly two prefixes: `_schd/` for items that are
//! scheduled or in progress, and `_cmpl/` for items that reached terminal
//! progress. The completed namespace is never watched by the engine; it is
//! retained for audit until an external compactor removes it.

use crate::item::MAX_WEIGHT;

/// Prefix for items requested by clients and still in the queue.
pub const SCHEDULED_PREFIX: &str = "_schd";

/// Prefix for items finished by workers.
pub const COMPLETED_PREFIX: &str = "_cmpl";

/// The KV key of a scheduled item.
pub fn scheduled_key(item_key: &str) -> String {
    format!("{}/{}", SCHEDULED_PREFIX, item_key)
}

/// The KV key of a completed item.
pub fn completed_key(item_key: &str) -> String {
    format!("{}/{}", COMPLETED_PREFIX, item_key)
}

/// Prefix under which every scheduled item of a bucket sorts in queue order.
pub fn scheduled_bucket_prefix(bucket: &str) -> String {
    format!("{}/{}/", SCHEDULED_PREFIX, bucket)
}

/// Construct the key for an item, ordered by weight and creation time.
///
/// The weight is inverted into a zero-padded 5-digit priority code (00000
/// is the highest weight) followed by the creation time in nanoseconds as
/// zero-padded 35-character uppercase hex, so that lexicographic order is
/// higher weight first, then earlier creation first.
pub fn item_key(bucket: &str, weight: u64, created_nanos: i64) -> String {
    let priority = MAX_WEIGHT - weight.min(MAX_WEIGHT);
    format!(
        "{}/{:05}{:035X}",
        bucket,
        priority,
        created_nanos.max(0) as u64
    )
}
