//! Collision-chain storage for one table slot.
//!
//! A [`Bucket`] maps keys to the list nodes that carry them. The map picks the
//! implementation once, through its type parameter:
//!
//! | Type | Storage | Key bound | find / insert / remove |
//! |------|---------|-----------|------------------------|
//! | [`OrderedBucket`] | `imbl::OrdMap` | `Ord + Clone` | `O(log n)` |
//! | [`ChainedBucket`] | `Vec` | `Eq` | `O(n)` |
//!
//! # Snapshots
//!
//! Readers never take the bucket lock. An installed bucket ([`BucketCell`])
//! publishes immutable snapshots: a writer clones the current storage under
//! the lock, mutates the clone and swaps it in, retiring the old snapshot
//! through seize. A lock-free `get` therefore always reads a complete store.
//! `OrdMap` clones share structure, so an ordered-bucket write copies only the
//! path it touches.

use std::fmt as StdFmt;
use std::sync::atomic::AtomicPtr;

use seize::{Collector, Guard, LocalGuard};

use crate::lock::{BucketLock, LockGuard};
use crate::node::NodeRef;
use crate::ordering::{READ_ORD, WRITE_ORD};

mod chained;
mod ordered;

pub use chained::ChainedBucket;
pub use ordered::OrderedBucket;

/// Which [`Bucket`] implementation a map uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    /// Balanced-tree buckets ([`OrderedBucket`]).
    Ordered,
    /// Linear-chain buckets ([`ChainedBucket`]).
    Chained,
}

impl StdFmt::Display for BucketKind {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        match self {
            Self::Ordered => write!(f, "ordered"),
            Self::Chained => write!(f, "chained"),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Storage for the nodes of one table slot.
///
/// Holds at most one node per key. All mutation happens on a private clone
/// while the bucket lock is held; lookups run against published snapshots.
///
/// This trait is sealed: the map relies on the two implementations in this
/// crate returning only nodes it stored.
pub trait Bucket<K, V>: Clone + Default + Sealed {
    /// Kind reported by [`ConcurrentLinkedHashMap::bucket_kind`](crate::ConcurrentLinkedHashMap::bucket_kind).
    const KIND: BucketKind;

    /// Insert `node` under `key` unless the key is present.
    ///
    /// Returns the existing node if there was one, leaving the bucket unchanged.
    fn insert_if_absent(&mut self, key: &K, node: NodeRef<K, V>) -> Option<NodeRef<K, V>>;

    /// Remove and return the node stored under `key`.
    fn remove(&mut self, key: &K) -> Option<NodeRef<K, V>>;

    /// Node stored under `key`.
    fn find(&self, key: &K) -> Option<NodeRef<K, V>>;

    /// Number of nodes in the bucket.
    fn len(&self) -> usize;

    /// All nodes, in storage order.
    fn nodes(&self) -> impl Iterator<Item = NodeRef<K, V>> + '_;

    /// Whether the bucket holds no node.
    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the node under `key` only if `accept` approves it.
    ///
    /// Used for compare-and-remove (value equality) and for identity checks
    /// when evicting the first list node.
    fn remove_if(
        &mut self,
        key: &K,
        accept: impl FnOnce(NodeRef<K, V>) -> bool,
    ) -> Option<NodeRef<K, V>> {
        let node: NodeRef<K, V> = self.find(key)?;
        if accept(node) { self.remove(key) } else { None }
    }

    /// Remove the node under `key` only if its current value equals `expected`.
    fn remove_if_value(
        &mut self,
        key: &K,
        expected: &V,
        guard: &LocalGuard<'_>,
    ) -> Option<NodeRef<K, V>>
    where
        V: PartialEq,
    {
        self.remove_if(key, |node| node.node().value_eq(expected, guard))
    }
}

// ============================================================================
//  BucketCell
// ============================================================================

/// An installed bucket: its lock and its current snapshot.
pub(crate) struct BucketCell<B> {
    lock: BucketLock,

    /// `Box<B>` raw pointer. Never null.
    store: AtomicPtr<B>,
}

impl<B> BucketCell<B> {
    /// Allocate a cell holding `bucket`.
    pub(crate) fn new(bucket: B) -> *mut Self {
        Box::into_raw(Box::new(Self {
            lock: BucketLock::new(),
            store: AtomicPtr::new(Box::into_raw(Box::new(bucket))),
        }))
    }

    #[inline]
    pub(crate) fn lock(&self) -> LockGuard<'_> {
        self.lock.lock()
    }

    /// Current snapshot, for lock-free readers.
    #[inline]
    pub(crate) fn snapshot<'g>(&self, guard: &'g LocalGuard<'_>) -> &'g B {
        let ptr: *mut B = guard.protect(&self.store, READ_ORD);

        // SAFETY: the store is never null and replaced snapshots are retired
        // through the collector, so this one outlives `guard`.
        unsafe { &*ptr }
    }

    /// Current snapshot, read by the lock holder.
    #[inline]
    pub(crate) fn locked<'l>(&'l self, _lock: &'l LockGuard<'_>) -> &'l B {
        // SAFETY: only lock holders replace the store, and we hold the lock.
        unsafe { &*self.store.load(READ_ORD) }
    }

    /// Replace the snapshot with `next` and retire the old one.
    pub(crate) fn publish(&self, next: B, _lock: &LockGuard<'_>, guard: &LocalGuard<'_>) {
        let next_ptr: *mut B = Box::into_raw(Box::new(next));
        let old: *mut B = self.store.swap(next_ptr, WRITE_ORD);

        // SAFETY: old came from Box::into_raw and is no longer reachable from
        // the cell. Readers that loaded it are protected by their guards.
        unsafe {
            guard.defer_retire(old, |ptr, _| {
                drop(Box::from_raw(ptr));
            });
        }
    }

    /// Free a cell and its current snapshot (seize callback).
    ///
    /// # Safety
    /// `ptr` must come from [`BucketCell::new`] and be unreachable from the table.
    pub(crate) unsafe fn reclaim(ptr: *mut Self, _collector: &Collector) {
        // SAFETY: caller guarantees exclusive ownership.
        unsafe { Self::free(ptr) };
    }

    /// Free a cell and its current snapshot immediately.
    ///
    /// # Safety
    /// `ptr` must come from [`BucketCell::new`] and no other thread may hold it.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        // SAFETY: caller guarantees exclusive ownership.
        let mut cell: Box<Self> = unsafe { Box::from_raw(ptr) };
        let store: *mut B = *cell.store.get_mut();
        // SAFETY: the store is owned by the cell.
        unsafe { drop(Box::from_raw(store)) };
    }
}
