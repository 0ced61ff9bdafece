//! List-ordered bucket for keys that are only `Eq`.

use std::fmt as StdFmt;

use super::{Bucket, BucketKind, Sealed};
use crate::node::NodeRef;

/// Bucket that keeps its nodes in a plain vector, in insertion order.
///
/// Lookups compare keys stored in the nodes themselves, so `K` needs neither
/// `Ord` nor `Clone`. Collisions are expected to be rare, which keeps the
/// linear scan short.
pub struct ChainedBucket<K, V> {
    nodes: Vec<NodeRef<K, V>>,
}

impl<K, V> Clone for ChainedBucket<K, V> {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
        }
    }
}

impl<K, V> Default for ChainedBucket<K, V> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<K: StdFmt::Debug, V> StdFmt::Debug for ChainedBucket<K, V> {
    fn fmt(&self, f: &mut StdFmt::Formatter<'_>) -> StdFmt::Result {
        f.debug_list()
            .entries(self.nodes.iter().map(NodeRef::key))
            .finish()
    }
}

impl<K, V> Sealed for ChainedBucket<K, V> {}

impl<K: Eq, V> ChainedBucket<K, V> {
    #[inline]
    fn position(&self, key: &K) -> Option<usize> {
        self.nodes.iter().position(|node| node.key() == key)
    }
}

impl<K: Eq, V> Bucket<K, V> for ChainedBucket<K, V> {
    const KIND: BucketKind = BucketKind::Chained;

    fn insert_if_absent(&mut self, key: &K, node: NodeRef<K, V>) -> Option<NodeRef<K, V>> {
        if let Some(i) = self.position(key) {
            return Some(self.nodes[i]);
        }
        self.nodes.push(node);
        None
    }

    fn remove(&mut self, key: &K) -> Option<NodeRef<K, V>> {
        let i: usize = self.position(key)?;
        Some(self.nodes.remove(i))
    }

    #[inline]
    fn find(&self, key: &K) -> Option<NodeRef<K, V>> {
        self.position(key).map(|i| self.nodes[i])
    }

    #[inline]
    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn nodes(&self) -> impl Iterator<Item = NodeRef<K, V>> + '_ {
        self.nodes.iter().copied()
    }
}
