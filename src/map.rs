//! The concurrent linked hash map.
//!
//! [`ConcurrentLinkedHashMap`] combines a fixed-size [`BucketTable`] with an
//! [`OrderingList`]:
//!
//! - keyed lookups go through the table: hash, slot, bucket snapshot, node;
//! - ordered traversal and eviction go through the list, oldest node first.
//!
//! # Write protocol
//! ```text
//!   put:    lock bucket -> publish snapshot with node -> link_last -> unlock
//!   remove: lock bucket -> publish snapshot without node -> [detach if empty]
//!           -> clear value (node dead) -> unlock -> unlink -> release node
//! ```
//!
//! A node is inserted in its bucket before it is linked, and marked dead before
//! it is unlinked, so list traversals never see a live node that a keyed lookup
//! would miss. Readers (`get`, iteration, `first_key`) take no lock.

use std::collections::hash_map::RandomState;
use std::fmt as StdFmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::ptr as StdPtr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use seize::{Collector, Guard, LocalGuard};

use crate::bucket::{Bucket, BucketCell, BucketKind, ChainedBucket, OrderedBucket};
use crate::iter::{Iter, Keys, Values};
use crate::list::OrderingList;
use crate::node::{Node, NodeRef, acquire, free_reachable, release};
use crate::ordering::RELAXED;
use crate::table::{BucketTable, DEFAULT_CAPACITY};
use crate::tracing_helpers::{error_log, trace_log, warn_log};

/// A concurrent hash map that remembers insertion order.
///
/// Keyed operations lock only the bucket of their key; lookups and traversal
/// are lock-free. Entries are kept in the order their keys were inserted (a
/// removed and re-inserted key moves to the back), and the oldest entry can be
/// evicted with [`poll_first`](Self::poll_first).
///
/// Values are returned as `Arc<V>`, so a reader keeps its value even if a
/// writer replaces or removes it concurrently.
///
/// # Bucket kind
/// `B` selects the collision-chain storage, fixed at construction:
/// [`new`](ConcurrentLinkedHashMap::new) gives [`OrderedBucket`]s for `Ord`
/// keys and [`chained`](ConcurrentLinkedHashMap::chained) gives
/// [`ChainedBucket`]s for keys that are only `Eq`.
///
/// # Capacity
/// The bucket table never grows. Its slot count is fixed at construction
/// (default 8); more entries than slots only lengthen the buckets.
///
/// # Example
/// ```rust
/// use clhm::ConcurrentLinkedHashMap;
///
/// let map: ConcurrentLinkedHashMap<&str, u32> = ConcurrentLinkedHashMap::new();
/// map.put("a", 1);
/// map.put("b", 2);
/// map.put("c", 3);
///
/// assert_eq!(map.get(&"b").as_deref(), Some(&2));
/// assert_eq!(map.first_key(), Some("a"));
///
/// let (key, value) = map.poll_first().unwrap();
/// assert_eq!((key, *value), ("a", 1));
/// assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "c"]);
/// ```
pub struct ConcurrentLinkedHashMap<K, V, B = OrderedBucket<K, V>, S = RandomState> {
    collector: Collector,
    table: BucketTable<B>,
    list: OrderingList<K, V>,
    size: AtomicUsize,
    hasher: S,
    _marker: PhantomData<(K, Arc<V>)>,
}

// SAFETY: keys are shared between threads by reference (`Sync`) and cloned
// out on any thread (`Send`); values are shared as `Arc<V>`. All interior
// mutation is atomic or under a bucket lock.
unsafe impl<K, V, B, S> Send for ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Send + Sync,
    V: Send + Sync,
    B: Send + Sync,
    S: Send,
{
}

// SAFETY: see the Send impl.
unsafe impl<K, V, B, S> Sync for ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Send + Sync,
    V: Send + Sync,
    B: Send + Sync,
    S: Sync,
{
}

// ============================================================================
//  Construction
// ============================================================================

impl<K, V> ConcurrentLinkedHashMap<K, V>
where
    K: Hash + Ord + Clone,
{
    /// Create an empty map with ordered buckets and the default slot count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty map with ordered buckets and at least `capacity` slots.
    ///
    /// The slot count is rounded up to a power of two and clamped to
    /// `1..=`[`MAXIMUM_CAPACITY`](crate::MAXIMUM_CAPACITY).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V> ConcurrentLinkedHashMap<K, V, ChainedBucket<K, V>>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty map with chained buckets, for keys without `Ord`.
    #[must_use]
    pub fn chained() -> Self {
        Self::chained_with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty map with chained buckets and at least `capacity` slots.
    #[must_use]
    pub fn chained_with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K, V, B, S> ConcurrentLinkedHashMap<K, V, B, S> {
    /// Create an empty map using `hasher` and the default slot count.
    #[must_use]
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_capacity_and_hasher(DEFAULT_CAPACITY, hasher)
    }

    /// Create an empty map with at least `capacity` slots, using `hasher`.
    #[must_use]
    pub fn with_capacity_and_hasher(capacity: usize, hasher: S) -> Self {
        Self {
            collector: Collector::new(),
            table: BucketTable::new(capacity),
            list: OrderingList::new(),
            size: AtomicUsize::new(0),
            hasher,
            _marker: PhantomData,
        }
    }

    /// Enter a protected region and return a guard.
    ///
    /// The `*_with_guard` methods take one so that a batch of operations can
    /// share it. Holding a guard delays reclamation of removed entries.
    #[must_use]
    #[inline]
    pub fn guard(&self) -> LocalGuard<'_> {
        self.collector.enter()
    }

    /// Number of live entries.
    ///
    /// Incremented once a new entry is linked and decremented once a removed
    /// one is unlinked, so concurrent writers can make it lag by the number
    /// of operations in flight.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.size.load(RELAXED)
    }

    /// Whether the map has no live entries.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of bucket slots. Fixed for the map's lifetime.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// The map's hasher.
    #[must_use]
    #[inline]
    pub const fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Iterate over entries in insertion order.
    ///
    /// Weakly consistent: entries added or removed during iteration may or
    /// may not be seen, but no entry is yielded twice. The iterator holds a
    /// guard, so a long-lived iterator delays reclamation.
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.list, self.guard())
    }

    /// Iterate over keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self.iter())
    }

    /// Iterate over values in insertion order.
    #[must_use]
    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self.iter())
    }

    /// Panics if `guard` was not created by this map.
    #[inline]
    fn verify(&self, guard: &LocalGuard<'_>) {
        assert!(
            StdPtr::eq(guard.collector(), &self.collector),
            "guard belongs to a different map"
        );
    }
}

// ============================================================================
//  Keyed operations
// ============================================================================

impl<K, V, B, S> ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Hash + Eq + Clone,
    B: Bucket<K, V>,
    S: BuildHasher,
{
    #[inline]
    fn hash(&self, key: &K) -> u64 {
        self.hasher.hash_one(key)
    }

    /// Which bucket implementation this map uses.
    #[must_use]
    #[inline]
    pub const fn bucket_kind(&self) -> BucketKind {
        B::KIND
    }

    /// Table slot that `key` hashes to.
    #[must_use]
    pub fn slot_of(&self, key: &K) -> usize {
        self.table.locate(self.hash(key))
    }

    /// Number of nodes in the bucket at `index`; zero for an empty slot.
    ///
    /// # Panics
    /// If `index >= self.capacity()`.
    #[must_use]
    pub fn slot_len(&self, index: usize) -> usize {
        assert!(
            index < self.capacity(),
            "slot index {index} out of range for {} slots",
            self.capacity()
        );
        let guard = self.guard();
        self.table
            .load(index, &guard)
            .map_or(0, |cell| cell.snapshot(&guard).len())
    }

    /// Value for `key`. Never blocks.
    #[must_use]
    #[inline]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.get_with_guard(key, &guard)
    }

    /// Value for `key`, using an explicit guard.
    ///
    /// # Panics
    /// If `guard` comes from another map.
    #[must_use]
    pub fn get_with_guard(&self, key: &K, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        self.verify(guard);
        let node: NodeRef<K, V> = self.find_node(key, guard)?;
        node.node().load_value(guard)
    }

    /// Whether `key` has a live entry.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        let guard = self.guard();
        self.find_node(key, &guard)
            .is_some_and(|node| !node.node().is_dead())
    }

    /// Lock-free lookup of the node for `key` in the current snapshot.
    #[inline]
    fn find_node(&self, key: &K, guard: &LocalGuard<'_>) -> Option<NodeRef<K, V>> {
        let index: usize = self.table.locate(self.hash(key));
        let cell: &BucketCell<B> = self.table.load(index, guard)?;
        let node: NodeRef<K, V> = cell.snapshot(guard).find(key)?;
        check_key(node, key);
        Some(node)
    }

    /// Insert or overwrite. Returns the previous value.
    ///
    /// A new key is appended to the back of the order; overwriting an
    /// existing key keeps its position.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.put_with_guard(key, value, &guard)
    }

    /// [`put`](Self::put) with an explicit guard.
    ///
    /// # Panics
    /// If `guard` comes from another map.
    pub fn put_with_guard(&self, key: K, value: V, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        self.verify(guard);
        self.put_val(key, Arc::new(value), false, guard)
    }

    /// Insert only if `key` is absent. Returns the current value if present,
    /// in which case the map is unchanged.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.put_if_absent_with_guard(key, value, &guard)
    }

    /// [`put_if_absent`](Self::put_if_absent) with an explicit guard.
    ///
    /// # Panics
    /// If `guard` comes from another map.
    pub fn put_if_absent_with_guard(
        &self,
        key: K,
        value: V,
        guard: &LocalGuard<'_>,
    ) -> Option<Arc<V>> {
        self.verify(guard);
        self.put_val(key, Arc::new(value), true, guard)
    }

    /// Shared insert path.
    ///
    /// The node is allocated once up front. If the key turns out to exist, its
    /// value is moved into the existing node (or handed back) and the spare
    /// node is freed without ever being published.
    fn put_val(
        &self,
        key: K,
        value: Arc<V>,
        only_if_absent: bool,
        guard: &LocalGuard<'_>,
    ) -> Option<Arc<V>> {
        let hash: u64 = self.hash(&key);
        let index: usize = self.table.locate(hash);
        let node_ptr: *mut Node<K, V> = Node::new(hash, key, value);
        // SAFETY: Node::new never returns null.
        let node: NodeRef<K, V> = unsafe { NodeRef::from_raw(node_ptr) };
        let key: &K = node.key();

        loop {
            let Some(cell) = self.table.load(index, guard) else {
                if self.install_bucket(index, node, guard) {
                    return None;
                }
                continue;
            };

            let lock = cell.lock();
            if lock.is_detached() {
                warn_log!(slot = index, "put: bucket detached, retrying");
                continue;
            }

            let current: &B = cell.locked(&lock);
            if let Some(existing) = current.find(key) {
                check_key(existing, key);
                // SAFETY: `node` was never published.
                let value: Arc<V> = unsafe { Node::into_value(node_ptr) };

                if only_if_absent {
                    let current_value: Option<Arc<V>> = existing.node().load_value(guard);
                    drop(lock);
                    return current_value;
                }

                let old: Arc<V> = existing.node().replace_value(value, guard);
                drop(lock);
                return Some(old);
            }

            let mut next: B = current.clone();
            next.insert_if_absent(key, node);
            cell.publish(next, &lock, guard);

            // SAFETY: the node is in the bucket and the lock is held, so no
            // remover can release it before it is linked.
            unsafe {
                acquire(node_ptr);
                self.list.link_last(node_ptr, guard);
            }
            // Counted before unlock so a remover never decrements first.
            self.size.fetch_add(1, RELAXED);
            drop(lock);
            return None;
        }
    }

    /// Install a new bucket holding `node` into the empty slot at `index`.
    ///
    /// The candidate is locked before it is published, so the node is linked
    /// before any other writer can touch the bucket. Returns `false` if another
    /// writer installed first; the candidate is then discarded.
    fn install_bucket(&self, index: usize, node: NodeRef<K, V>, guard: &LocalGuard<'_>) -> bool {
        let mut bucket: B = B::default();
        bucket.insert_if_absent(node.key(), node);

        let cell_ptr: *mut BucketCell<B> = BucketCell::new(bucket);
        // SAFETY: fresh allocation, freed below only if never published.
        let cell: &BucketCell<B> = unsafe { &*cell_ptr };
        let lock = cell.lock();

        if !self.table.install(index, cell_ptr) {
            drop(lock);
            // SAFETY: the table did not take the cell.
            unsafe { BucketCell::free(cell_ptr) };
            return false;
        }

        // SAFETY: as in put_val, the lock keeps removers away.
        unsafe {
            acquire(node.as_ptr());
            self.list.link_last(node.as_ptr(), guard);
        }
        self.size.fetch_add(1, RELAXED);
        drop(lock);
        true
    }

    /// Remove `key`. Returns the removed value.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let guard = self.guard();
        self.remove_with_guard(key, &guard)
    }

    /// [`remove`](Self::remove) with an explicit guard.
    ///
    /// # Panics
    /// If `guard` comes from another map.
    pub fn remove_with_guard(&self, key: &K, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        self.verify(guard);
        let hash: u64 = self.hash(key);
        self.remove_node(key, hash, guard, |bucket| bucket.remove(key))
    }

    /// Remove `key` only if its value equals `expected`.
    pub fn remove_if(&self, key: &K, expected: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = self.guard();
        let hash: u64 = self.hash(key);
        self.remove_node(key, hash, &guard, |bucket| {
            bucket.remove_if_value(key, expected, &guard)
        })
        .is_some()
    }

    /// Shared removal path.
    ///
    /// `take` removes the node from a private copy of the bucket, or declines.
    fn remove_node<F>(&self, key: &K, hash: u64, guard: &LocalGuard<'_>, take: F) -> Option<Arc<V>>
    where
        F: FnOnce(&mut B) -> Option<NodeRef<K, V>>,
    {
        let index: usize = self.table.locate(hash);

        loop {
            let cell: &BucketCell<B> = self.table.load(index, guard)?;
            let mut lock = cell.lock();
            if lock.is_detached() {
                warn_log!(slot = index, "remove: bucket detached, retrying");
                continue;
            }

            let current: &B = cell.locked(&lock);
            current.find(key)?;

            let mut next: B = current.clone();
            let node: NodeRef<K, V> = take(&mut next)?;
            check_key(node, key);

            let emptied: bool = next.is_empty();
            cell.publish(next, &lock, guard);
            // Dead before the slot empties, so a concurrent put of the same
            // key never links a second live node next to this one.
            let value: Arc<V> = node.node().kill(guard);
            if emptied {
                lock.mark_detached();
                self.table.detach(index, cell, guard);
            }
            drop(lock);

            // SAFETY: the bucket's membership count is still ours to release.
            unsafe {
                self.list.unlink(node.as_ptr(), guard);
                release(node.as_ptr(), guard);
            }
            self.size.fetch_sub(1, RELAXED);
            return Some(value);
        }
    }

    /// Set `key` to `new` only if its current value equals `old`.
    ///
    /// The entry keeps its position in the order.
    pub fn replace(&self, key: &K, old: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let guard = self.guard();
        self.with_locked_node(key, &guard, |node| {
            if node.node().value_eq(old, &guard) {
                drop(node.node().replace_value(Arc::new(new), &guard));
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    /// Overwrite the value of `key` only if it is present. Returns the old value.
    pub fn replace_value(&self, key: &K, value: V) -> Option<Arc<V>> {
        let guard = self.guard();
        self.with_locked_node(key, &guard, |node| {
            node.node().replace_value(Arc::new(value), &guard)
        })
    }

    /// Run `f` on the node for `key` while holding its bucket lock.
    fn with_locked_node<R, F>(&self, key: &K, guard: &LocalGuard<'_>, f: F) -> Option<R>
    where
        F: FnOnce(NodeRef<K, V>) -> R,
    {
        let index: usize = self.table.locate(self.hash(key));

        loop {
            let cell: &BucketCell<B> = self.table.load(index, guard)?;
            let lock = cell.lock();
            if lock.is_detached() {
                warn_log!(slot = index, "replace: bucket detached, retrying");
                continue;
            }

            let node: NodeRef<K, V> = cell.locked(&lock).find(key)?;
            check_key(node, key);
            let result: R = f(node);
            drop(lock);
            return Some(result);
        }
    }

    // ========================================================================
    //  Ordered operations
    // ========================================================================

    /// Key of the oldest live entry.
    #[must_use]
    pub fn first_key(&self) -> Option<K> {
        let guard = self.guard();
        let first: *mut Node<K, V> = self.list.first_live(&guard)?;
        // SAFETY: protected by guard.
        unsafe { &*first }.key().cloned()
    }

    /// Oldest live entry, without removing it.
    #[must_use]
    pub fn first_entry(&self) -> Option<(K, Arc<V>)> {
        let guard = self.guard();
        loop {
            let first: *mut Node<K, V> = self.list.first_live(&guard)?;
            // SAFETY: protected by guard.
            let node: &Node<K, V> = unsafe { &*first };
            if let (Some(key), Some(value)) = (node.key(), node.load_value(&guard)) {
                return Some((key.clone(), value));
            }
        }
    }

    /// Remove and return the oldest live entry.
    pub fn poll_first(&self) -> Option<(K, Arc<V>)> {
        let guard = self.guard();
        self.poll_first_with_guard(&guard)
    }

    /// [`poll_first`](Self::poll_first) with an explicit guard.
    ///
    /// The first live node is removed only if it is still the node its
    /// bucket holds for that key; otherwise the walk restarts from the head.
    ///
    /// # Panics
    /// If `guard` comes from another map.
    pub fn poll_first_with_guard(&self, guard: &LocalGuard<'_>) -> Option<(K, Arc<V>)> {
        self.verify(guard);

        loop {
            let first: *mut Node<K, V> = self.list.first_live(guard)?;
            // SAFETY: protected by guard.
            let node: &Node<K, V> = unsafe { &*first };
            let Some(key) = node.key().cloned() else {
                error_log!("poll_first: sentinel reported live");
                unreachable!("sentinel reported live");
            };

            let removed: Option<Arc<V>> = self.remove_node(&key, node.hash(), guard, |bucket| {
                bucket.remove_if(&key, |candidate| candidate.as_ptr() == first)
            });
            if let Some(value) = removed {
                return Some((key, value));
            }

            trace_log!("poll_first: head entry changed, restarting");
        }
    }

    /// Remove every entry, oldest first.
    pub fn clear(&self) {
        while self.poll_first().is_some() {}
    }
}

/// A bucket must only hand back the node stored under the key it was asked for.
#[inline]
fn check_key<K: Eq, V>(node: NodeRef<K, V>, key: &K) {
    if node.key() != key {
        error_log!("bucket returned a node for a different key");
        panic!("bucket returned a node for a different key");
    }
}

// ============================================================================
//  Trait impls
// ============================================================================

impl<K, V, B, S> Drop for ConcurrentLinkedHashMap<K, V, B, S> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no guard of this collector is alive.
        // Pending count decrements run first so only still-referenced nodes
        // remain.
        unsafe { self.collector.reclaim_all() };

        for cell in self.table.take_all() {
            // SAFETY: drained from the table; the collector holds no more
            // retirements for it.
            unsafe { BucketCell::free(cell) };
        }

        // Every bucket node is live and therefore linked, so walking from the
        // list ends reaches all of them.
        // SAFETY: exclusive access at teardown.
        unsafe { free_reachable([self.list.head(), self.list.tail()]) };
    }
}

impl<K, V> Default for ConcurrentLinkedHashMap<K, V>
where
    K: Hash + Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, B, S> StdFmt::Debug for ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Clone + StdFmt::Debug,
    V: StdFmt::Debug,
{
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for ConcurrentLinkedHashMap<K, V>
where
    K: Hash + Ord + Clone,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map: Self = Self::new();
        for (key, value) in iter {
            map.put(key, value);
        }
        map
    }
}

impl<K, V, B, S> Extend<(K, V)> for ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Hash + Eq + Clone,
    B: Bucket<K, V>,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
        let guard = self.guard();
        for (key, value) in iter {
            self.put_with_guard(key, value, &guard);
        }
    }
}

impl<'m, K, V, B, S> IntoIterator for &'m ConcurrentLinkedHashMap<K, V, B, S>
where
    K: Clone,
{
    type Item = (K, Arc<V>);
    type IntoIter = Iter<'m, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
