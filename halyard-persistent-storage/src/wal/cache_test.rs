use crate::wal::cache::Cache;
use halyard_core::{LogEntry, Operation};

fn entry(index: u64) -> LogEntry {
    LogEntry::new(index, 1, Operation::set(format!("k{index}"), vec![index as u8])).unwrap()
}

fn filled(range: std::ops::RangeInclusive<u64>) -> Cache {
    let mut cache = Cache::new();
    for i in range {
        cache.insert(entry(i));
    }
    cache
}

/// Test: capacity eviction
///
/// Purpose
/// - Ensure `evict_to` drops the oldest entries first
///
/// Expected
/// - Only the newest `capacity` indices remain, in order
#[test]
fn evict_to_keeps_newest() {
    let mut cache = filled(1..=10);
    cache.evict_to(3);
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.first_index(), Some(8));
    let indices: Vec<u64> = cache.range(0, u64::MAX).iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![8, 9, 10]);
}

/// Test: prefix and suffix truncation
///
/// Purpose
/// - Validate the two truncation helpers used by collapse and by follower divergence repair
///
/// Expected
/// - `evict_below(4)` removes 1..=3; `truncate_after(6)` removes 7..
#[test]
fn truncation_bounds_are_inclusive_of_survivors() {
    let mut cache = filled(1..=10);
    cache.evict_below(4);
    cache.truncate_after(6);
    let indices: Vec<u64> = cache.range(0, u64::MAX).iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![4, 5, 6]);
    assert!(cache.get(7).is_none());
    assert_eq!(cache.get(5).map(|e| e.index), Some(5));
}

#[test]
fn empty_or_inverted_ranges() {
    let mut cache = filled(1..=3);
    assert!(cache.range(3, 2).is_empty());
    cache.clear();
    assert_eq!(cache.first_index(), None);
}
