//! Insertion-order iterators over a [`ConcurrentLinkedHashMap`](crate::ConcurrentLinkedHashMap).
//!
//! All three iterators walk the ordering list from the head, skipping dead
//! nodes. They own a guard, so every node they reach stays allocated until the
//! iterator is dropped. Items are owned: keys are cloned and values are
//! `Arc` clones.

use std::fmt as StdFmt;
use std::sync::Arc;

use seize::LocalGuard;

use crate::list::OrderingList;
use crate::node::Node;

/// Iterator over `(K, Arc<V>)` entries in insertion order.
pub struct Iter<'m, K, V> {
    list: &'m OrderingList<K, V>,
    cursor: *mut Node<K, V>,
    guard: LocalGuard<'m>,
}

impl<'m, K, V> Iter<'m, K, V> {
    pub(crate) fn new(list: &'m OrderingList<K, V>, guard: LocalGuard<'m>) -> Self {
        Self {
            list,
            cursor: list.head(),
            guard,
        }
    }
}

impl<K: Clone, V> Iterator for Iter<'_, K, V> {
    type Item = (K, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let next: *mut Node<K, V> = self.list.next_live(self.cursor, &self.guard)?;
            self.cursor = next;

            // SAFETY: reached under `self.guard`, which lives as long as the cursor.
            let node: &Node<K, V> = unsafe { &*next };

            // The node may have died since next_live checked it.
            if let (Some(key), Some(value)) = (node.key(), node.load_value(&self.guard)) {
                return Some((key.clone(), value));
            }
        }
    }
}

impl<K, V> StdFmt::Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_struct("Iter").field("cursor", &self.cursor).finish_non_exhaustive()
    }
}

/// Iterator over keys in insertion order.
#[derive(Debug)]
pub struct Keys<'m, K, V> {
    inner: Iter<'m, K, V>,
}

impl<'m, K, V> Keys<'m, K, V> {
    pub(crate) const fn new(inner: Iter<'m, K, V>) -> Self {
        Self { inner }
    }
}

impl<K: Clone, V> Iterator for Keys<'_, K, V> {
    type Item = K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(key, _)| key)
    }
}

/// Iterator over values in insertion order.
#[derive(Debug)]
pub struct Values<'m, K, V> {
    inner: Iter<'m, K, V>,
}

impl<'m, K, V> Values<'m, K, V> {
    pub(crate) const fn new(inner: Iter<'m, K, V>) -> Self {
        Self { inner }
    }
}

impl<K: Clone, V> Iterator for Values<'_, K, V> {
    type Item = Arc<V>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, value)| value)
    }
}
