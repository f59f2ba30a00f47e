use hopper::keys::{
    completed_key, item_key, scheduled_bucket_prefix, scheduled_key, COMPLETED_PREFIX,
    SCHEDULED_PREFIX,
};
use hopper::MAX_WEIGHT;

#[test]
fn test_item_key_orders_higher_weight_first() {
    let low = item_key("b", 10, 1_000);
    let high = item_key("b", 90, 1_000);
    assert!(
        high < low,
        "higher weight should sort first\nhigh: {:?}\nlow: {:?}",
        high,
        low
    );
}

#[test]
fn test_item_key_breaks_ties_by_creation_time() {
    let early = item_key("b", 50, 1_000);
    let late = item_key("b", 50, 2_000);
    assert!(early < late, "earlier creation should sort first");
}

#[test]
fn test_item_key_clamps_weight() {
    let clamped = item_key("b", MAX_WEIGHT + 7, 1_000);
    let max = item_key("b", MAX_WEIGHT, 1_000);
    assert_eq!(clamped, max);
}

#[test]
fn test_item_key_shape() {
    // Weight 0 inverts to the lowest priority code; time is 35 hex chars
    let key = item_key("bucket", 0, 0);
    assert_eq!(key, format!("bucket/99999{}", "0".repeat(35)));

    let key = item_key("bucket", MAX_WEIGHT, i64::MAX);
    assert_eq!(key, format!("bucket/00000{:035X}", i64::MAX));
}

#[test]
fn test_item_key_negative_time_clamps_to_zero() {
    assert_eq!(item_key("b", 1, -5), item_key("b", 1, 0));
}

#[test]
fn test_namespaces_are_disjoint() {
    let key = item_key("b", 1, 1);
    let schd = scheduled_key(&key);
    let cmpl = completed_key(&key);
    assert!(schd.starts_with(SCHEDULED_PREFIX));
    assert!(cmpl.starts_with(COMPLETED_PREFIX));
    assert_ne!(schd, cmpl);
    assert!(!schd.starts_with(COMPLETED_PREFIX));
}

#[test]
fn test_bucket_prefix_scanning() {
    let key = scheduled_key(&item_key("b", 42, 7));
    let prefix = scheduled_bucket_prefix("b");
    assert!(key.starts_with(&prefix));

    // A sibling bucket sharing the name prefix must NOT match
    let other = scheduled_key(&item_key("bb", 42, 7));
    assert!(
        !other.starts_with(&prefix),
        "bucket \"bb\" must not match prefix {:?}",
        prefix
    );
}

#[test]
fn test_queue_order_across_weights_and_times() {
    let mut keys = vec![
        item_key("b", 10, 100),
        item_key("b", 99_999, 50),
        item_key("b", 500, 10),
        item_key("b", 500, 20),
        item_key("b", 0, 1),
    ];
    keys.sort();
    assert_eq!(
        keys,
        vec![
            item_key("b", 99_999, 50),
            item_key("b", 500, 10),
            item_key("b", 500, 20),
            item_key("b", 10, 100),
            item_key("b", 0, 1),
        ]
    );
}
