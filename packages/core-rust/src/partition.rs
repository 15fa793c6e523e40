//! Partition identifier ordering.
//!
//! Streams name their partitions with opaque strings, but in practice these
//! are almost always decimal integers (`"0"`, `"1"`, ..., `"31"`). Ordering
//! them lexicographically would place `"10"` before `"2"`, so every
//! deterministic tie-break in the crate goes through [`compare_partition_ids`]:
//!
//! - numeric ids compare numerically
//! - numeric ids sort before non-numeric ids
//! - non-numeric ids compare lexicographically

use std::cmp::Ordering;

/// Total order over partition identifiers. See the module docs.
#[must_use]
pub fn compare_partition_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Sorts partition ids in place using [`compare_partition_ids`] and removes duplicates.
pub fn sort_partition_ids(ids: &mut Vec<String>) {
    ids.sort_by(|a, b| compare_partition_ids(a, b));
    ids.dedup();
}
