//! Tree-ordered bucket backed by a persistent B-tree.

use std::fmt as StdFmt;

use imbl::OrdMap;

use super::{Bucket, BucketKind, Sealed};
use crate::node::NodeRef;

/// Bucket that keeps its nodes in key order.
///
/// Requires `K: Ord + Clone`: the tree stores its own copy of each key.
/// Cloning a snapshot is `O(1)` and a write copies `O(log n)` tree nodes.
pub struct OrderedBucket<K, V> {
    entries: OrdMap<K, NodeRef<K, V>>,
}

impl<K: Ord + Clone, V> Clone for OrderedBucket<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K: Ord + Clone, V> Default for OrderedBucket<K, V> {
    fn default() -> Self {
        Self {
            entries: OrdMap::new(),
        }
    }
}

impl<K: StdFmt::Debug + Ord + Clone, V> StdFmt::Debug for OrderedBucket<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl<K, V> Sealed for OrderedBucket<K, V> {}

impl<K: Ord + Clone, V> Bucket<K, V> for OrderedBucket<K, V> {
    const KIND: BucketKind = BucketKind::Ordered;

    fn insert_if_absent(&mut self, key: &K, node: NodeRef<K, V>) -> Option<NodeRef<K, V>> {
        if let Some(existing) = self.entries.get(key) {
            return Some(*existing);
        }
        self.entries.insert(key.clone(), node);
        None
    }

    #[inline]
    fn remove(&mut self, key: &K) -> Option<NodeRef<K, V>> {
        self.entries.remove(key)
    }

    #[inline]
    fn find(&self, key: &K) -> Option<NodeRef<K, V>> {
        self.entries.get(key).copied()
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn nodes(&self) -> impl Iterator<Item = NodeRef<K, V>> + '_ {
        self.entries.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::Node;

    #[test]
    fn test_nodes_come_out_in_key_order() {
        let mut bucket: OrderedBucket<u32, ()> = OrderedBucket::default();
        let nodes: Vec<NodeRef<u32, ()>> = [30, 10, 20]
            .into_iter()
            .map(|k| {
                // SAFETY: Box::into_raw is non-null.
                let node = unsafe { NodeRef::from_raw(Node::new(0, k, Arc::new(()))) };
                assert!(bucket.insert_if_absent(&k, node).is_none());
                node
            })
            .collect();

        let keys: Vec<u32> = bucket.nodes().map(|n| *n.key()).collect();
        assert_eq!(keys, vec![10, 20, 30]);
        assert_eq!(format!("{bucket:?}"), "{10, 20, 30}");

        for node in nodes {
            // SAFETY: never published.
            drop(unsafe { Node::into_value(node.as_ptr()) });
        }
    }
}
