//! Single-threaded behaviour of `ConcurrentLinkedHashMap`: ordering,
//! tombstones, bucket lifecycle and the convenience surface.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use std::collections::HashSet;
use std::hash::{BuildHasher, Hasher};

use clhm::{
    BucketKind, ChainedBucket, ConcurrentLinkedHashMap, DEFAULT_CAPACITY, MAXIMUM_CAPACITY,
    OrderedBucket,
};

/// Hashes every key to zero, so all keys share one bucket.
#[derive(Debug, Clone, Copy, Default)]
struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

impl BuildHasher for ZeroHasher {
    type Hasher = Self;

    fn build_hasher(&self) -> Self::Hasher {
        Self
    }
}

fn keys_of<B, S>(map: &ConcurrentLinkedHashMap<u32, u32, B, S>) -> Vec<u32> {
    map.keys().collect()
}

// ============================================================================
//  Ordering
// ============================================================================

#[test]
fn test_first_key_follows_insertion_order() {
    common::init_tracing();

    let map: ConcurrentLinkedHashMap<&str, u32> = ConcurrentLinkedHashMap::new();
    map.put("a", 1);
    map.put("b", 2);
    map.put("c", 3);
    assert_eq!(map.first_key(), Some("a"));

    assert_eq!(map.poll_first().map(|(k, v)| (k, *v)), Some(("a", 1)));
    assert_eq!(map.first_key(), Some("b"));
    assert_eq!(map.poll_first().map(|(k, _)| k), Some("b"));
    assert_eq!(map.poll_first().map(|(k, _)| k), Some("c"));
    assert_eq!(map.poll_first(), None);
    assert_eq!(map.first_key(), None);
    assert!(map.is_empty());
}

#[test]
fn test_overwrite_keeps_position_reinsert_moves_to_back() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    for k in 1..=4 {
        map.put(k, k);
    }

    // Overwrite: same node, same place.
    assert_eq!(map.put(2, 20).as_deref(), Some(&2));
    assert_eq!(keys_of(&map), vec![1, 2, 3, 4]);

    // Remove and re-insert: fresh node at the back.
    map.remove(&2);
    map.put(2, 200);
    assert_eq!(keys_of(&map), vec![1, 3, 4, 2]);
    assert_eq!(map.get(&2).as_deref(), Some(&200));
}

#[test]
fn test_iteration_skips_removed_and_never_repeats() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::with_capacity(4);
    for k in 0..100 {
        map.put(k, k * 10);
    }
    for k in (0..100).filter(|k| k % 3 == 0) {
        assert_eq!(map.remove(&k).as_deref(), Some(&(k * 10)));
    }
    for k in (0..100).filter(|k| k % 6 == 0) {
        map.put(k, k);
    }

    let keys = keys_of(&map);
    let unique: HashSet<u32> = keys.iter().copied().collect();
    assert_eq!(keys.len(), unique.len());
    assert_eq!(keys.len(), map.len());

    let survivors: Vec<u32> = (0..100).filter(|k| k % 3 != 0).collect();
    let readded: Vec<u32> = (0..100).filter(|k| k % 6 == 0).collect();
    assert_eq!(keys, [survivors, readded].concat());

    let values: Vec<u32> = map.values().map(|v| *v).collect();
    assert_eq!(values[0], 10);
    assert_eq!(*values.last().unwrap(), 96);
}

#[test]
fn test_first_entry_does_not_remove() {
    let map: ConcurrentLinkedHashMap<u32, String> = ConcurrentLinkedHashMap::new();
    assert!(map.first_entry().is_none());

    map.put(9, "nine".to_string());
    map.put(3, "three".to_string());
    let (key, value) = map.first_entry().unwrap();
    assert_eq!((key, value.as_str()), (9, "nine"));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_clear_drains_everything() {
    let map: ConcurrentLinkedHashMap<u32, u32> = (0..50).map(|k| (k, k)).collect();
    assert_eq!(map.len(), 50);
    map.clear();
    assert!(map.is_empty());
    assert_eq!(map.iter().count(), 0);
    for slot in 0..map.capacity() {
        assert_eq!(map.slot_len(slot), 0);
    }

    map.put(1, 1);
    assert_eq!(keys_of(&map), vec![1]);
}

// ============================================================================
//  Tombstones and buckets
// ============================================================================

#[test]
fn test_removed_value_is_never_returned() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    map.put(5, 50);
    assert_eq!(map.remove(&5).as_deref(), Some(&50));
    assert!(map.get(&5).is_none());
    assert!(!map.contains_key(&5));
    assert!(map.remove(&5).is_none());

    map.put(5, 51);
    assert_eq!(map.get(&5).as_deref(), Some(&51));
    assert_eq!(map.iter().filter(|(k, _)| *k == 5).count(), 1);
}

#[test]
fn test_emptied_bucket_is_detached_and_rebuilt() {
    let map: ConcurrentLinkedHashMap<u32, u32, OrderedBucket<u32, u32>, ZeroHasher> =
        ConcurrentLinkedHashMap::with_hasher(ZeroHasher);
    for k in 0..5 {
        map.put(k, k);
    }
    let slot = map.slot_of(&0);
    assert_eq!(map.slot_len(slot), 5);

    for k in 0..5 {
        map.remove(&k);
    }
    assert_eq!(map.slot_len(slot), 0);
    assert!(map.is_empty());

    map.put(42, 42);
    assert_eq!(map.slot_len(slot), 1);
    assert_eq!(keys_of(&map), vec![42]);
}

#[test]
fn test_bucket_kind_is_fixed_by_constructor() {
    let ordered: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    let chained: ConcurrentLinkedHashMap<u32, u32, ChainedBucket<u32, u32>> =
        ConcurrentLinkedHashMap::chained();
    assert_eq!(ordered.bucket_kind(), BucketKind::Ordered);
    assert_eq!(chained.bucket_kind(), BucketKind::Chained);

    for k in 0..20 {
        ordered.put(k, k);
        chained.put(k, k);
    }
    assert_eq!(ordered.bucket_kind(), BucketKind::Ordered);
    assert_eq!(chained.bucket_kind(), BucketKind::Chained);
}

#[test]
fn test_chained_map_with_eq_only_keys() {
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Token(&'static str);

    let map = ConcurrentLinkedHashMap::chained_with_capacity(2);
    map.put(Token("x"), 1);
    map.put(Token("y"), 2);
    map.put(Token("z"), 3);

    assert_eq!(map.get(&Token("y")).as_deref(), Some(&2));
    assert!(map.remove_if(&Token("y"), &2));
    assert_eq!(
        map.keys().collect::<Vec<_>>(),
        vec![Token("x"), Token("z")]
    );
}

#[test]
fn test_capacity_rounding() {
    let default: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    assert_eq!(default.capacity(), DEFAULT_CAPACITY);

    let rounded: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::with_capacity(100);
    assert_eq!(rounded.capacity(), 128);

    let zero: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::with_capacity(0);
    assert_eq!(zero.capacity(), 1);
    assert!(MAXIMUM_CAPACITY.is_power_of_two());
}

// ============================================================================
//  Conditional updates
// ============================================================================

#[test]
fn test_replace_compares_current_value() {
    let map: ConcurrentLinkedHashMap<&str, u32> = ConcurrentLinkedHashMap::new();
    assert!(!map.replace(&"k", &1, 2));

    map.put("k", 1);
    map.put("j", 0);
    assert!(!map.replace(&"k", &7, 2));
    assert!(map.replace(&"k", &1, 2));
    assert_eq!(map.get(&"k").as_deref(), Some(&2));

    // No relink: k stays first.
    assert_eq!(map.first_key(), Some("k"));
    assert_eq!(map.len(), 2);
}

#[test]
fn test_replace_value_only_if_present() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    assert!(map.replace_value(&1, 10).is_none());
    assert!(map.get(&1).is_none());

    map.put(1, 1);
    assert_eq!(map.replace_value(&1, 10).as_deref(), Some(&1));
    assert_eq!(map.get(&1).as_deref(), Some(&10));
}

#[test]
fn test_remove_if_requires_matching_value() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    map.put(1, 1);
    assert!(!map.remove_if(&1, &2));
    assert!(map.contains_key(&1));
    assert!(map.remove_if(&1, &1));
    assert!(!map.contains_key(&1));
    assert!(!map.remove_if(&1, &1));
}

// ============================================================================
//  Guards and surface
// ============================================================================

#[test]
fn test_guard_api_batches_operations() {
    let map: ConcurrentLinkedHashMap<u32, u32> = ConcurrentLinkedHashMap::new();
    let guard = map.guard();
    for k in 0..10 {
        map.put_with_guard(k, k, &guard);
    }
    assert_eq!(map.put_if_absent_with_guard(3, 33, &guard).as_deref(), Some(&3));
    assert_eq!(map.get_with_guard(&4, &guard).as_deref(), Some(&4));
    assert_eq!(map.remove_with_guard(&4, &guard).as_deref(), Some(&4));
    assert_eq!(map.poll_first_with_guard(&guard).map(|(k, _)| k), Some(0));
    drop(guard);
    assert_eq!(map.len(), 8);
}

#[test]
fn test_removed_value_outlives_removal() {
    let map: ConcurrentLinkedHashMap<u32, Vec<u8>> = ConcurrentLinkedHashMap::new();
    map.put(1, vec![1, 2, 3]);
    let held = map.get(&1).unwrap();
    map.remove(&1);
    map.put(1, vec![9]);
    assert_eq!(*held, vec![1, 2, 3]);
    assert_eq!(map.get(&1).as_deref(), Some(&vec![9]));
}

#[test]
fn test_debug_renders_in_order() {
    let mut map: ConcurrentLinkedHashMap<u32, &str> = ConcurrentLinkedHashMap::new();
    map.extend([(3, "c"), (1, "a"), (2, "b")]);
    assert_eq!(format!("{map:?}"), r#"{3: "c", 1: "a", 2: "b"}"#);

    let pairs: Vec<(u32, &str)> = (&map).into_iter().map(|(k, v)| (k, *v)).collect();
    assert_eq!(pairs, vec![(3, "c"), (1, "a"), (2, "b")]);
}

#[test]
fn test_from_iterator_last_write_wins() {
    let map: ConcurrentLinkedHashMap<u32, u32> =
        [(1, 1), (2, 2), (1, 10)].into_iter().collect();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get(&1).as_deref(), Some(&10));
    assert_eq!(keys_of(&map), vec![1, 2]);
}
