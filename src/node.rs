//! Ordering-list nodes and their reference-counted links.
//!
//! A [`Node`] carries one key, an atomic value slot and the `prev`/`next`
//! links of the ordering list. The value slot holds a pointer obtained from
//! [`Arc::into_raw`]; a null slot means the node is dead (tombstoned). Dead is
//! permanent: a removed key that comes back gets a fresh node.
//!
//! # Reclamation
//!
//! Unlinked nodes can still be pointed at by stale links of other dead nodes,
//! so a node cannot simply be retired when it leaves the list. Instead every
//! incoming pointer holds one count in [`Node::refs`]:
//!
//! - each `prev` and `next` link that points at the node,
//! - the list's `head` and `tail` fields,
//! - membership in the current bucket snapshot.
//!
//! Increments happen before a pointer is published. Decrements go through
//! `guard.defer_retire`, so they only run once every guard that could have
//! loaded the old pointer has exited. When a count reaches zero the node is
//! freed and the counts it held on its own neighbours are dropped in turn.

use std::collections::HashSet;
use std::fmt as StdFmt;
use std::marker::PhantomData;
use std::ptr::{self as StdPtr, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize};

use seize::{Collector, Guard, LocalGuard};

use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED};

/// One element of the ordering list.
pub(crate) struct Node<K, V> {
    /// Hash of `key`, cached so the owning bucket can be found from the node.
    hash: u64,

    /// `None` only for the list's sentinel head.
    key: Option<K>,

    /// `Arc<V>` raw pointer, or null once the node is dead.
    value: AtomicPtr<V>,

    pub(crate) prev: AtomicPtr<Self>,
    pub(crate) next: AtomicPtr<Self>,

    /// Number of counted pointers that reference this node.
    refs: AtomicUsize,
}

impl<K, V> Node<K, V> {
    /// Allocate a live, unlinked node with no references.
    pub(crate) fn new(hash: u64, key: K, value: Arc<V>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            hash,
            key: Some(key),
            value: AtomicPtr::new(Arc::into_raw(value).cast_mut()),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            next: AtomicPtr::new(StdPtr::null_mut()),
            refs: AtomicUsize::new(0),
        }))
    }

    /// Allocate the permanently dead head sentinel.
    ///
    /// `refs` starts at 2: the list's `head` field and its `tail` field.
    pub(crate) fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            hash: 0,
            key: None,
            value: AtomicPtr::new(StdPtr::null_mut()),
            prev: AtomicPtr::new(StdPtr::null_mut()),
            next: AtomicPtr::new(StdPtr::null_mut()),
            refs: AtomicUsize::new(2),
        }))
    }

    #[inline]
    pub(crate) const fn hash(&self) -> u64 {
        self.hash
    }

    /// The node's key. `None` for the sentinel.
    #[inline]
    pub(crate) const fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Whether the value slot has been cleared.
    #[inline]
    pub(crate) fn is_dead(&self) -> bool {
        self.value.load(READ_ORD).is_null()
    }

    /// Current value, or `None` if the node is dead.
    ///
    /// The returned `Arc` is a fresh strong reference; the pointer it came
    /// from is kept alive by `guard` until the increment has happened.
    #[inline]
    pub(crate) fn load_value(&self, guard: &LocalGuard<'_>) -> Option<Arc<V>> {
        let ptr: *mut V = guard.protect(&self.value, READ_ORD);
        if ptr.is_null() {
            return None;
        }

        // SAFETY: ptr came from Arc::into_raw and is retired through the
        // collector, so it is valid while `guard` is held.
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// Compare the current value with `expected`. Dead nodes never match.
    #[inline]
    pub(crate) fn value_eq(&self, expected: &V, guard: &LocalGuard<'_>) -> bool
    where
        V: PartialEq,
    {
        let ptr: *mut V = guard.protect(&self.value, READ_ORD);

        // SAFETY: non-null value pointers stay valid while `guard` is held.
        !ptr.is_null() && unsafe { &*ptr } == expected
    }

    /// Store `value` and return the previous one.
    ///
    /// The caller must hold the owning bucket's lock and the node must be live.
    /// The returned `Arc` is a clone; the old raw pointer is retired through
    /// `guard` so concurrent readers that loaded it can still finish.
    pub(crate) fn replace_value(&self, value: Arc<V>, guard: &LocalGuard<'_>) -> Arc<V> {
        let new_ptr: *mut V = Arc::into_raw(value).cast_mut();
        let old_ptr: *mut V = self.value.swap(new_ptr, CAS_SUCCESS);
        debug_assert!(!old_ptr.is_null(), "replace_value on a dead node");

        // SAFETY: old_ptr came from Arc::into_raw and has not been retired yet.
        unsafe { retire_value(old_ptr, guard) }
    }

    /// Clear the value slot, making the node dead. Returns the removed value.
    ///
    /// The caller must hold the owning bucket's lock and the node must be live.
    pub(crate) fn kill(&self, guard: &LocalGuard<'_>) -> Arc<V> {
        let old_ptr: *mut V = self.value.swap(StdPtr::null_mut(), CAS_SUCCESS);
        assert!(!old_ptr.is_null(), "node killed twice");

        // SAFETY: see replace_value.
        unsafe { retire_value(old_ptr, guard) }
    }

    /// Take the value back out of a node that was never published and free it.
    ///
    /// # Safety
    /// `ptr` must come from [`Node::new`] and must never have been stored in a
    /// link, a bucket or the tail.
    pub(crate) unsafe fn into_value(ptr: *mut Self) -> Arc<V> {
        // SAFETY: caller guarantees exclusive ownership.
        let node: Box<Self> = unsafe { Box::from_raw(ptr) };
        let value: *mut V = node.value.swap(StdPtr::null_mut(), RELAXED);
        debug_assert_eq!(node.refs.load(RELAXED), 0);

        // SAFETY: value came from Arc::into_raw; the node no longer owns it.
        unsafe { Arc::from_raw(value) }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        let value: *mut V = *self.value.get_mut();
        if !value.is_null() {
            // SAFETY: a dropped node is unreachable, so nobody can load its value.
            unsafe { drop(Arc::from_raw(value)) };
        }
    }
}

/// Clone the `Arc` behind `ptr` and defer dropping the slot's own reference.
///
/// # Safety
/// `ptr` must come from `Arc::into_raw` and must just have been unlinked from
/// its value slot.
pub(crate) unsafe fn retire_value<V>(ptr: *mut V, guard: &LocalGuard<'_>) -> Arc<V> {
    // SAFETY: the slot's reference is still alive until the deferred drop.
    unsafe {
        Arc::increment_strong_count(ptr);
        let cloned: Arc<V> = Arc::from_raw(ptr);
        guard.defer_retire(ptr, |ptr, _| {
            drop(Arc::from_raw(ptr));
        });
        cloned
    }
}

// ============================================================================
//  Reference counting
// ============================================================================

/// Add one count for a pointer that is about to be published.
///
/// # Safety
/// `ptr` must be null or point to a node that is kept alive by the caller
/// (a held count or a guard-protected load).
#[inline]
pub(crate) unsafe fn acquire<K, V>(ptr: *mut Node<K, V>) {
    if !ptr.is_null() {
        // SAFETY: caller guarantees the node is alive.
        unsafe { (*ptr).refs.fetch_add(1, RELAXED) };
    }
}

/// Drop one count once every current guard has exited.
///
/// # Safety
/// The caller must own the count being released and must not use it again.
#[inline]
pub(crate) unsafe fn release<K, V>(ptr: *mut Node<K, V>, guard: &LocalGuard<'_>) {
    if !ptr.is_null() {
        // SAFETY: forwarded to release_node after the grace period.
        unsafe { guard.defer_retire(ptr, release_node::<K, V>) };
    }
}

/// Seize callback: drop one count and free the node if it was the last.
///
/// Freeing a node drops the counts held by its own `prev` and `next` links.
/// Those cascade iteratively; they do not need another grace period because a
/// node whose count reached zero had no incoming pointer left for any live
/// guard to have followed.
///
/// # Safety
/// `ptr` must point to a node allocated by [`Node::new`] or
/// [`Node::sentinel`] with a count owned by the caller.
pub(crate) unsafe fn release_node<K, V>(ptr: *mut Node<K, V>, _collector: &Collector) {
    let mut pending: Vec<*mut Node<K, V>> = vec![ptr];

    while let Some(ptr) = pending.pop() {
        // SAFETY: every pointer on the stack carries a count we own.
        let remaining: usize = unsafe { (*ptr).refs.fetch_sub(1, CAS_SUCCESS) };
        debug_assert!(remaining > 0, "node reference count underflow");
        if remaining != 1 {
            continue;
        }

        // SAFETY: count reached zero, nothing else references the node.
        let mut node: Box<Node<K, V>> = unsafe { Box::from_raw(ptr) };
        for link in [*node.prev.get_mut(), *node.next.get_mut()] {
            if !link.is_null() {
                pending.push(link);
            }
        }
    }
}

/// Compare-and-swap a counted link.
///
/// Takes a count on `new` before publishing it. On success the count held by
/// `expected` is released; on failure the extra count on `new` is.
///
/// # Safety
/// `new` and `expected` must be null or nodes kept alive by `guard`.
#[inline]
pub(crate) unsafe fn cas_link<K, V>(
    link: &AtomicPtr<Node<K, V>>,
    expected: *mut Node<K, V>,
    new: *mut Node<K, V>,
    guard: &LocalGuard<'_>,
) -> bool {
    // SAFETY: caller guarantees liveness of both pointers.
    unsafe {
        acquire(new);
        match link.compare_exchange(expected, new, CAS_SUCCESS, CAS_FAILURE) {
            Ok(_) => {
                release(expected, guard);
                true
            }
            Err(_) => {
                release(new, guard);
                false
            }
        }
    }
}

/// Free every node reachable from `roots` through `prev`/`next` links.
///
/// Used at teardown after all deferred decrements have run. Each node is
/// freed exactly once, whatever its remaining count.
///
/// # Safety
/// No other thread may access the nodes, and every root must be null or a
/// live node.
pub(crate) unsafe fn free_reachable<K, V>(roots: impl IntoIterator<Item = *mut Node<K, V>>) {
    let mut visited: HashSet<*mut Node<K, V>> = HashSet::new();
    let mut stack: Vec<*mut Node<K, V>> = roots.into_iter().filter(|p| !p.is_null()).collect();

    while let Some(ptr) = stack.pop() {
        if !visited.insert(ptr) {
            continue;
        }

        // SAFETY: reachable through counted links, hence not yet freed.
        let node: &Node<K, V> = unsafe { &*ptr };
        for link in [node.prev.load(RELAXED), node.next.load(RELAXED)] {
            if !link.is_null() && !visited.contains(&link) {
                stack.push(link);
            }
        }
    }

    for ptr in visited {
        // SAFETY: each pointer visited once, exclusive access at teardown.
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

// ============================================================================
//  NodeRef
// ============================================================================

/// Handle to a node held by a bucket snapshot.
///
/// Only the map creates these. A node referenced by a bucket snapshot is kept
/// alive by its membership count for as long as that snapshot is reachable
/// from a guard.
pub struct NodeRef<K, V> {
    ptr: NonNull<Node<K, V>>,
    _marker: PhantomData<(K, Arc<V>)>,
}

impl<K, V> NodeRef<K, V> {
    /// # Safety
    /// `ptr` must be non-null and point to a node from [`Node::new`].
    pub(crate) const unsafe fn from_raw(ptr: *mut Node<K, V>) -> Self {
        Self {
            // SAFETY: caller guarantees non-null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) const fn as_ptr(self) -> *mut Node<K, V> {
        self.ptr.as_ptr()
    }

    /// Borrow the node.
    #[inline]
    pub(crate) const fn node(&self) -> &Node<K, V> {
        // SAFETY: bucket membership keeps the node alive while the snapshot
        // holding this handle is reachable.
        unsafe { self.ptr.as_ref() }
    }

    /// The node's key. Bucket nodes are never the sentinel.
    #[inline]
    pub(crate) fn key(&self) -> &K {
        match self.node().key() {
            Some(key) => key,
            None => unreachable!("sentinel stored in a bucket"),
        }
    }
}

impl<K, V> Clone for NodeRef<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for NodeRef<K, V> {}

impl<K, V> PartialEq for NodeRef<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<K, V> Eq for NodeRef<K, V> {}

impl<K, V> StdFmt::Debug for NodeRef<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_tuple("NodeRef").field(&self.ptr).finish()
    }
}

// SAFETY: a NodeRef is a shared handle; the node's key is read and its value
// slot is accessed atomically from any thread.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for NodeRef<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for NodeRef<K, V> {}
