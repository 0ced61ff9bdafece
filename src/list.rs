//! Lock-free doubly-linked list that threads every node in insertion order.
//!
//! # Layout
//! ```text
//!   head (sentinel, dead) <-> n1 <-> n2 <-> ... <-> nk
//!                                                    ^
//!                                         tail (lags, may point further back)
//! ```
//!
//! Appends go to the node whose `next` is null. Exactly one linked node has a
//! null `next`: the most recently appended one. Repair never bypasses it, so
//! walking `next` from any node (including an unlinked one) always reaches the
//! real end of the list.
//!
//! # Ordering of links
//! `next` always points at a node appended later and `prev` at one appended
//! earlier, so neither direction can cycle and every `prev` walk ends at the
//! sentinel.
//!
//! # Removal
//! A node is tombstoned by clearing its value slot under its bucket lock.
//! [`OrderingList::unlink`] then repairs the list without locks:
//!
//! 1. find the nearest live predecessor and successor,
//! 2. CAS the predecessor's `next` and the successor's `prev` past the dead run,
//! 3. move `tail` back to the live predecessor if it pointed at the removed
//!    node, whether or not the node was last,
//! 4. redirect `prev` links that still point at the removed node.
//!
//! Step 3 keeps `tail` on a node reachable from `head` in sequential use. Step
//! 4 breaks `a.next == b && b.prev == a` pairs between unlinked nodes, which
//! would otherwise keep each other's reference counts above zero. Repair is
//! best effort; a lost CAS leaves a dead node in place and traversals skip it.
//! Under contention `tail` can briefly rest on an unlinked node. Appends
//! tolerate this because walking `next` from any node reaches the real end.
//!
//! All pointer loads happen under a seize guard. A pointer loaded from a link
//! of a node that is itself protected stays valid for the guard's lifetime,
//! because the count the link held is only dropped after a grace period.

use std::ptr::NonNull;
use std::sync::atomic::AtomicPtr;

use seize::{Guard, LocalGuard};

use crate::node::{Node, acquire, cas_link, release};
use crate::ordering::{READ_ORD, RELAXED};
use crate::tracing_helpers::trace_log;



/// Insertion-ordered list anchored by a sentinel head and a lagging tail.
pub(crate) struct OrderingList<K, V> {
    /// Permanently dead sentinel. Never changes, never freed before teardown.
    head: NonNull<Node<K, V>>,

    /// A node at or before the end of the list.
    tail: AtomicPtr<Node<K, V>>,
}

impl<K, V> OrderingList<K, V> {
    pub(crate) fn new() -> Self {
        let head: *mut Node<K, V> = Node::sentinel();
        Self {
            // SAFETY: Box::into_raw never returns null.
            head: unsafe { NonNull::new_unchecked(head) },
            tail: AtomicPtr::new(head),
        }
    }

    #[inline]
    pub(crate) const fn head(&self) -> *mut Node<K, V> {
        self.head.as_ptr()
    }

    /// Current tail pointer, for teardown.
    #[inline]
    pub(crate) fn tail(&self) -> *mut Node<K, V> {
        self.tail.load(RELAXED)
    }

    /// Append `node` after the last node of the list.
    ///
    /// # Safety
    /// `node` must be live, kept alive by a count the caller holds, and not yet
    /// linked. It must not be appended twice.
    pub(crate) unsafe fn link_last(&self, node: *mut Node<K, V>, guard: &LocalGuard<'_>) {
        // SAFETY: caller keeps node alive.
        let new: &Node<K, V> = unsafe { &*node };
        let mut attempts: u32 = 0;

        loop {
            let tail: *mut Node<K, V> = guard.protect(&self.tail, READ_ORD);

            let mut last: *mut Node<K, V> = tail;
            loop {
                // SAFETY: reached through counted links under `guard`.
                let next: *mut Node<K, V> = guard.protect(unsafe { &(*last).next }, READ_ORD);
                if next.is_null() {
                    break;
                }
                last = next;
            }

            // `new.prev` is private until the CAS below publishes the node.
            // SAFETY: last is protected; the previous prev's count is ours.
            unsafe {
                acquire(last);
                let old_prev: *mut Node<K, V> = new.prev.swap(last, RELAXED);
                release(old_prev, guard);
            }

            // SAFETY: last is protected, node is kept alive by the caller.
            if unsafe { cas_link(&(*last).next, std::ptr::null_mut(), node, guard) } {
                // Best effort: a lagging tail is advanced by later appends.
                // SAFETY: both pointers are protected.
                unsafe { cas_link(&self.tail, tail, node, guard) };

                if attempts > 0 {
                    trace_log!(attempts, "link_last: appended after retries");
                }
                return;
            }

            attempts += 1;
        }
    }

    /// Repair the list around the dead node `x`.
    ///
    /// # Safety
    /// `x` must be linked, dead, and kept alive by a count the caller holds.
    pub(crate) unsafe fn unlink(&self, x: *mut Node<K, V>, guard: &LocalGuard<'_>) {
        // SAFETY: caller keeps x alive.
        let node: &Node<K, V> = unsafe { &*x };
        debug_assert!(node.is_dead(), "unlink of a live node");

        let prev: *mut Node<K, V> = guard.protect(&node.prev, READ_ORD);
        let next: *mut Node<K, V> = guard.protect(&node.next, READ_ORD);
        if prev.is_null() {
            return;
        }

        // SAFETY: every pointer below is read from a protected node's link.
        unsafe {
            let active_prev: *mut Node<K, V> = find_prev_active(prev, guard);
            skip_deleted_successors(active_prev, guard);

            if cas_link(&self.tail, x, active_prev, guard) {
                trace_log!("unlink: tail moved back to live predecessor");
            }
            if !next.is_null() {
                let active_next: *mut Node<K, V> = find_next_active(next, guard);
                skip_deleted_predecessors(active_next, guard);
            }

            // Drop back-references into x held by x itself and by the dead
            // run that follows it.
            if prev != active_prev {
                cas_link(&node.prev, prev, active_prev, guard);
            }

            let mut dead: *mut Node<K, V> = guard.protect(&node.next, READ_ORD);
            while !dead.is_null() && (*dead).is_dead() {
                cas_link(&(*dead).prev, x, active_prev, guard);
                dead = guard.protect(&(*dead).next, READ_ORD);
            }
        }
    }

    /// First live node after the sentinel.
    #[inline]
    pub(crate) fn first_live(&self, guard: &LocalGuard<'_>) -> Option<*mut Node<K, V>> {
        self.next_live(self.head(), guard)
    }

    /// First live node strictly after `from`.
    ///
    /// `from` must be protected by `guard`. Dead nodes are skipped; a node
    /// removed after it was returned is the caller's to re-check.
    pub(crate) fn next_live(
        &self,
        from: *mut Node<K, V>,
        guard: &LocalGuard<'_>,
    ) -> Option<*mut Node<K, V>> {
        // SAFETY: from is protected by the caller's guard.
        let mut cursor: *mut Node<K, V> = guard.protect(unsafe { &(*from).next }, READ_ORD);

        while !cursor.is_null() {
            // SAFETY: reached through counted links under `guard`.
            let node: &Node<K, V> = unsafe { &*cursor };
            if !node.is_dead() {
                return Some(cursor);
            }
            cursor = guard.protect(&node.next, READ_ORD);
        }

        None
    }
}

/// Walk `prev` from `src` while dead. Stops at the sentinel.
///
/// # Safety
/// `src` must be protected by `guard`.
unsafe fn find_prev_active<K, V>(src: *mut Node<K, V>, guard: &LocalGuard<'_>) -> *mut Node<K, V> {
    let mut n: *mut Node<K, V> = src;
    loop {
        // SAFETY: reached through counted links under `guard`.
        let node: &Node<K, V> = unsafe { &*n };
        if !node.is_dead() {
            return n;
        }
        let p: *mut Node<K, V> = guard.protect(&node.prev, READ_ORD);
        if p.is_null() {
            return n;
        }
        n = p;
    }
}

/// Walk `next` from `src` while dead. Never goes past the last node.
///
/// # Safety
/// `src` must be protected by `guard`.
unsafe fn find_next_active<K, V>(src: *mut Node<K, V>, guard: &LocalGuard<'_>) -> *mut Node<K, V> {
    let mut n: *mut Node<K, V> = src;
    loop {
        // SAFETY: reached through counted links under `guard`.
        let node: &Node<K, V> = unsafe { &*n };
        if !node.is_dead() {
            return n;
        }
        let p: *mut Node<K, V> = guard.protect(&node.next, READ_ORD);
        if p.is_null() {
            return n;
        }
        n = p;
    }
}

/// Point `x.next` past the dead run that follows it.
///
/// # Safety
/// `x` must be protected by `guard`.
unsafe fn skip_deleted_successors<K, V>(x: *mut Node<K, V>, guard: &LocalGuard<'_>) {
    // SAFETY: x is protected.
    let node: &Node<K, V> = unsafe { &*x };
    let p: *mut Node<K, V> = guard.protect(&node.next, READ_ORD);
    if p.is_null() {
        return;
    }

    // SAFETY: p and n are reached through counted links.
    unsafe {
        let n: *mut Node<K, V> = find_next_active(p, guard);
        if p != n {
            cas_link(&node.next, p, n, guard);
        }
    }
}

/// Point `x.prev` past the dead run that precedes it.
///
/// # Safety
/// `x` must be protected by `guard`.
unsafe fn skip_deleted_predecessors<K, V>(x: *mut Node<K, V>, guard: &LocalGuard<'_>) {
    // SAFETY: x is protected.
    let node: &Node<K, V> = unsafe { &*x };
    let p: *mut Node<K, V> = guard.protect(&node.prev, READ_ORD);
    if p.is_null() {
        return;
    }

    // SAFETY: p and n are reached through counted links.
    unsafe {
        let n: *mut Node<K, V> = find_prev_active(p, guard);
        if p != n {
            cas_link(&node.prev, p, n, guard);
        }
    }
}
