use std::iter::FusedIterator;

use super::{Augment, BalancedTree, NodeIdx};

/// Forward in-order iterator over a [`BalancedTree`].
pub struct Iter<'a, K, V, A>
where
    A: Augment<K, V>,
{
    tree: &'a BalancedTree<K, V, A>,
    next: Option<NodeIdx>,
}

impl<'a, K: Ord, V, A: Augment<K, V>> Iter<'a, K, V, A> {
    pub(super) fn new(tree: &'a BalancedTree<K, V, A>, start: Option<NodeIdx>) -> Self {
        Self { tree, next: start }
    }
}

impl<'a, K: Ord, V, A: Augment<K, V>> Iterator for Iter<'a, K, V, A> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        self.next = self.tree.successor(idx);
        let node = self.tree.view(idx);
        Some((node.key, node.value))
    }
}

impl<K: Ord, V, A: Augment<K, V>> FusedIterator for Iter<'_, K, V, A> {}

impl<'a, K: Ord, V, A: Augment<K, V>> IntoIterator for &'a BalancedTree<K, V, A> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
