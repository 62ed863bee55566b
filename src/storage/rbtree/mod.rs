#![forbid(unsafe_code)]

//! Arena-backed red-black tree with a pluggable subtree summary.
//!
//! Nodes live in a `Vec` and refer to each other by index. Children are owned
//! by position in the tree; the parent index is only a back-reference used for
//! upward walks and rotations. Removing a node swaps the last arena slot into
//! the hole, so indices stay dense.
//!
//! Every node carries an [`Augment::Summary`] computed from its own entry and
//! its children's summaries. The engine recomputes it after each rotation and
//! splice, which is all an augmented structure such as the interval tree needs.

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;
use std::mem;

use crate::types::{Result, SombraError};

mod iter;

pub use iter::Iter;

/// Index of a node inside the tree arena.
pub(crate) type NodeIdx = usize;

/// Node color.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Color {
    /// Red node.
    Red,
    /// Black node.
    Black,
}

/// Per-node data derived from a node's entry and its children.
///
/// The tree calls [`summarize`](Self::summarize) bottom-up whenever the shape
/// below a node changes.
pub trait Augment<K, V> {
    /// Cached subtree data.
    type Summary: Clone + PartialEq;

    /// Computes the summary of a node from its entry and its children's summaries.
    fn summarize(
        key: &K,
        value: &V,
        left: Option<&Self::Summary>,
        right: Option<&Self::Summary>,
    ) -> Self::Summary;
}

/// No augmentation.
#[derive(Copy, Clone, Debug, Default)]
pub struct Plain;

impl<K, V> Augment<K, V> for Plain {
    type Summary = ();

    fn summarize(_: &K, _: &V, _: Option<&()>, _: Option<&()>) {}
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

struct Node<K, V, S> {
    key: K,
    value: V,
    summary: S,
    color: Color,
    parent: Option<NodeIdx>,
    left: Option<NodeIdx>,
    right: Option<NodeIdx>,
}

/// Borrowed view of one node, used by augmented layers to walk the tree.
pub(crate) struct NodeView<'a, K, V, S> {
    pub key: &'a K,
    pub value: &'a V,
    pub summary: &'a S,
    pub left: Option<NodeIdx>,
    pub right: Option<NodeIdx>,
}

/// Ordered map kept balanced by red-black coloring.
pub struct BalancedTree<K, V, A = Plain>
where
    A: Augment<K, V>,
{
    nodes: Vec<Node<K, V, A::Summary>>,
    root: Option<NodeIdx>,
    _augment: PhantomData<A>,
}

impl<K: Ord, V, A: Augment<K, V>> Default for BalancedTree<K, V, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord, V, A: Augment<K, V>> BalancedTree<K, V, A> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            _augment: PhantomData,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    /// Inserts `key -> value`.
    ///
    /// If `key` is already present the tree is left unchanged and `false` is
    /// returned; the first entry for a key wins.
    pub fn insert(&mut self, key: K, value: V) -> Result<bool> {
        let mut slot: Option<(NodeIdx, Side)> = None;
        let mut cursor = self.root;
        while let Some(idx) = cursor {
            let side = match key.cmp(&self.nodes[idx].key) {
                Ordering::Equal => return Ok(false),
                Ordering::Less => Side::Left,
                Ordering::Greater => Side::Right,
            };
            slot = Some((idx, side));
            cursor = self.child(idx, side);
        }

        let summary = A::summarize(&key, &value, None, None);
        let idx = self.nodes.len();
        let parent = slot.map(|(p, _)| p);
        self.nodes.push(Node {
            key,
            value,
            summary,
            color: Color::Red,
            parent,
            left: None,
            right: None,
        });
        match slot {
            None => self.root = Some(idx),
            Some((p, side)) => self.set_child(p, side, Some(idx)),
        }
        self.refresh_upwards(parent, true);
        self.insert_fixup(idx)?;
        Ok(true)
    }

    /// Removes `key`, returning its entry if it was present.
    pub fn remove(&mut self, key: &K) -> Result<Option<(K, V)>> {
        let Some(target) = self.find_idx(key) else {
            return Ok(None);
        };

        // A node with two children trades places with its in-order successor,
        // which has at most one child and is spliced out instead.
        let victim = match (self.nodes[target].left, self.nodes[target].right) {
            (Some(_), Some(right)) => {
                let successor = self.leftmost(right);
                self.swap_entries(target, successor);
                successor
            }
            _ => target,
        };

        let child = self.nodes[victim].left.or(self.nodes[victim].right);
        let parent = self.nodes[victim].parent;
        let side = match parent {
            Some(p) => Some(self.side_of(p, victim)?),
            None => None,
        };
        if let Some(c) = child {
            self.nodes[c].parent = parent;
        }
        self.replace_child(parent, victim, child);
        self.refresh_upwards(parent, false);

        match (self.nodes[victim].color, child) {
            (Color::Black, Some(c)) if self.nodes[c].color == Color::Red => {
                self.nodes[c].color = Color::Black;
            }
            (Color::Black, Some(_)) => {
                return Err(SombraError::TreeInvariant(
                    "black node with a single black child",
                ));
            }
            (Color::Black, None) => {
                if let (Some(p), Some(side)) = (parent, side) {
                    self.erase_fixup(p, side)?;
                }
            }
            (Color::Red, Some(_)) => {
                return Err(SombraError::TreeInvariant("red node with a single child"));
            }
            (Color::Red, None) => {}
        }

        let node = self.release(victim);
        Ok(Some((node.key, node.value)))
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_idx(key).map(|idx| &self.nodes[idx].value)
    }

    /// Returns true if `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_idx(key).is_some()
    }

    /// In-order iterator positioned at `key`; exhausted if `key` is absent.
    pub fn find(&self, key: &K) -> Iter<'_, K, V, A> {
        Iter::new(self, self.find_idx(key))
    }

    /// In-order iterator over all entries.
    pub fn iter(&self) -> Iter<'_, K, V, A> {
        Iter::new(self, self.root.map(|root| self.leftmost(root)))
    }

    /// Smallest entry.
    pub fn first(&self) -> Option<(&K, &V)> {
        self.iter().next()
    }

    pub(crate) fn root_idx(&self) -> Option<NodeIdx> {
        self.root
    }

    pub(crate) fn view(&self, idx: NodeIdx) -> NodeView<'_, K, V, A::Summary> {
        let node = &self.nodes[idx];
        NodeView {
            key: &node.key,
            value: &node.value,
            summary: &node.summary,
            left: node.left,
            right: node.right,
        }
    }

    /// In-order successor of `idx`.
    pub(crate) fn successor(&self, idx: NodeIdx) -> Option<NodeIdx> {
        if let Some(right) = self.nodes[idx].right {
            return Some(self.leftmost(right));
        }
        let mut node = idx;
        let mut parent = self.nodes[node].parent;
        while let Some(p) = parent {
            if self.nodes[p].left == Some(node) {
                return Some(p);
            }
            node = p;
            parent = self.nodes[p].parent;
        }
        None
    }

    fn find_idx(&self, key: &K) -> Option<NodeIdx> {
        let mut cursor = self.root;
        while let Some(idx) = cursor {
            let node = &self.nodes[idx];
            cursor = match key.cmp(&node.key) {
                Ordering::Equal => return Some(idx),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        None
    }

    fn leftmost(&self, mut idx: NodeIdx) -> NodeIdx {
        while let Some(left) = self.nodes[idx].left {
            idx = left;
        }
        idx
    }

    fn child(&self, idx: NodeIdx, side: Side) -> Option<NodeIdx> {
        match side {
            Side::Left => self.nodes[idx].left,
            Side::Right => self.nodes[idx].right,
        }
    }

    fn set_child(&mut self, idx: NodeIdx, side: Side, child: Option<NodeIdx>) {
        match side {
            Side::Left => self.nodes[idx].left = child,
            Side::Right => self.nodes[idx].right = child,
        }
    }

    fn side_of(&self, parent: NodeIdx, child: NodeIdx) -> Result<Side> {
        let node = &self.nodes[parent];
        if node.left == Some(child) {
            Ok(Side::Left)
        } else if node.right == Some(child) {
            Ok(Side::Right)
        } else {
            Err(SombraError::TreeInvariant("parent does not own child"))
        }
    }

    fn color(&self, idx: Option<NodeIdx>) -> Color {
        idx.map_or(Color::Black, |idx| self.nodes[idx].color)
    }

    /// Points whatever held `old` (a parent slot or the root) at `new`.
    fn replace_child(&mut self, parent: Option<NodeIdx>, old: NodeIdx, new: Option<NodeIdx>) {
        match parent {
            None => self.root = new,
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = new,
            Some(p) => self.nodes[p].right = new,
        }
    }

    fn swap_entries(&mut self, a: NodeIdx, b: NodeIdx) {
        debug_assert_ne!(a, b);
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let (head, tail) = self.nodes.split_at_mut(hi);
        let (x, y) = (&mut head[lo], &mut tail[0]);
        mem::swap(&mut x.key, &mut y.key);
        mem::swap(&mut x.value, &mut y.value);
    }

    /// Recomputes the summary of `idx`; returns true if it changed.
    fn refresh(&mut self, idx: NodeIdx) -> bool {
        let node = &self.nodes[idx];
        let summary = A::summarize(
            &node.key,
            &node.value,
            node.left.map(|l| &self.nodes[l].summary),
            node.right.map(|r| &self.nodes[r].summary),
        );
        let node = &mut self.nodes[idx];
        if node.summary == summary {
            false
        } else {
            node.summary = summary;
            true
        }
    }

    /// Refreshes summaries from `start` to the root. With `stop_early`, the walk
    /// ends at the first node whose summary did not change.
    fn refresh_upwards(&mut self, start: Option<NodeIdx>, stop_early: bool) {
        let mut cursor = start;
        while let Some(idx) = cursor {
            if !self.refresh(idx) && stop_early {
                return;
            }
            cursor = self.nodes[idx].parent;
        }
    }

    /// Rotates `x` down towards `dir`; its child on the opposite side takes its place.
    fn rotate(&mut self, x: NodeIdx, dir: Side) -> Result<()> {
        let y = self
            .child(x, dir.opposite())
            .ok_or(SombraError::TreeInvariant("rotation without a pivot child"))?;
        let inner = self.child(y, dir);
        self.set_child(x, dir.opposite(), inner);
        if let Some(inner) = inner {
            self.nodes[inner].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.nodes[y].parent = parent;
        self.replace_child(parent, x, Some(y));
        self.set_child(y, dir, Some(x));
        self.nodes[x].parent = Some(y);
        // x is now below y, so it goes first.
        self.refresh(x);
        self.refresh(y);
        Ok(())
    }

    fn insert_fixup(&mut self, mut node: NodeIdx) -> Result<()> {
        loop {
            let Some(parent) = self.nodes[node].parent else {
                self.nodes[node].color = Color::Black;
                return Ok(());
            };
            if self.nodes[parent].color == Color::Black {
                return Ok(());
            }
            let grand = self
                .nodes[parent]
                .parent
                .ok_or(SombraError::TreeInvariant("red root"))?;
            let parent_side = self.side_of(grand, parent)?;
            let uncle = self.child(grand, parent_side.opposite());
            if let Some(uncle) = uncle.filter(|&u| self.nodes[u].color == Color::Red) {
                self.nodes[parent].color = Color::Black;
                self.nodes[uncle].color = Color::Black;
                self.nodes[grand].color = Color::Red;
                node = grand;
                continue;
            }

            let mut parent = parent;
            if self.side_of(parent, node)? != parent_side {
                // Inner grandchild: straighten the zig-zag first.
                self.rotate(parent, parent_side)?;
                parent = node;
            }
            self.nodes[parent].color = Color::Black;
            self.nodes[grand].color = Color::Red;
            return self.rotate(grand, parent_side.opposite());
        }
    }

    /// Restores black-height after a black leaf was removed from `side` of `parent`.
    fn erase_fixup(&mut self, mut parent: NodeIdx, mut side: Side) -> Result<()> {
        loop {
            let mut sibling = self.child(parent, side.opposite()).ok_or_else(missing_sibling)?;
            if self.nodes[sibling].color == Color::Red {
                self.nodes[parent].color = Color::Red;
                self.nodes[sibling].color = Color::Black;
                self.rotate(parent, side)?;
                sibling = self.child(parent, side.opposite()).ok_or_else(missing_sibling)?;
            }

            let near = self.child(sibling, side);
            let far = self.child(sibling, side.opposite());
            let nephews_black =
                self.color(near) == Color::Black && self.color(far) == Color::Black;
            if nephews_black && self.nodes[sibling].color == Color::Black {
                self.nodes[sibling].color = Color::Red;
                if self.nodes[parent].color == Color::Red {
                    self.nodes[parent].color = Color::Black;
                    return Ok(());
                }
                // The deficit moves up one level.
                match self.nodes[parent].parent {
                    None => return Ok(()),
                    Some(grand) => {
                        side = self.side_of(grand, parent)?;
                        parent = grand;
                        continue;
                    }
                }
            }

            if self.color(far) == Color::Black {
                // Near nephew is red: turn it into the far one.
                let near = near.ok_or(SombraError::TreeInvariant("red nephew missing"))?;
                self.nodes[sibling].color = Color::Red;
                self.nodes[near].color = Color::Black;
                self.rotate(sibling, side.opposite())?;
                sibling = self.child(parent, side.opposite()).ok_or_else(missing_sibling)?;
            }

            self.nodes[sibling].color = self.nodes[parent].color;
            self.nodes[parent].color = Color::Black;
            if let Some(far) = self.child(sibling, side.opposite()) {
                self.nodes[far].color = Color::Black;
            }
            return self.rotate(parent, side);
        }
    }

    /// Frees the arena slot of an unlinked node, moving the last slot into it.
    fn release(&mut self, idx: NodeIdx) -> Node<K, V, A::Summary> {
        let last = self.nodes.len() - 1;
        let node = self.nodes.swap_remove(idx);
        if idx != last {
            let moved = &self.nodes[idx];
            let (parent, left, right) = (moved.parent, moved.left, moved.right);
            match parent {
                None => self.root = Some(idx),
                Some(p) if self.nodes[p].left == Some(last) => self.nodes[p].left = Some(idx),
                Some(p) => self.nodes[p].right = Some(idx),
            }
            for child in [left, right].into_iter().flatten() {
                self.nodes[child].parent = Some(idx);
            }
        }
        node
    }
}

fn missing_sibling() -> SombraError {
    SombraError::TreeInvariant("double-black node without sibling")
}

#[cfg(test)]
impl<K: Ord + fmt::Debug, V, A: Augment<K, V>> BalancedTree<K, V, A>
where
    A::Summary: fmt::Debug,
{
    /// Checks order, coloring, parent links and summaries; returns the black-height.
    pub(crate) fn assert_invariants(&self) -> usize {
        let Some(root) = self.root else {
            assert!(self.nodes.is_empty(), "empty tree with live nodes");
            return 0;
        };
        assert_eq!(self.nodes[root].parent, None, "root has a parent");
        assert_eq!(self.nodes[root].color, Color::Black, "root is red");
        let mut seen = 0usize;
        let height = self.assert_subtree(root, None, None, &mut seen);
        assert_eq!(seen, self.nodes.len(), "unreachable arena slots");
        height
    }

    fn assert_subtree(
        &self,
        idx: NodeIdx,
        lower: Option<&K>,
        upper: Option<&K>,
        seen: &mut usize,
    ) -> usize {
        *seen += 1;
        let node = &self.nodes[idx];
        if let Some(lower) = lower {
            assert!(&node.key > lower, "order violated at {:?}", node.key);
        }
        if let Some(upper) = upper {
            assert!(&node.key < upper, "order violated at {:?}", node.key);
        }
        let mut heights = [0usize; 2];
        for (slot, child) in [node.left, node.right].into_iter().enumerate() {
            if let Some(child) = child {
                assert_eq!(self.nodes[child].parent, Some(idx), "stale parent link");
                if node.color == Color::Red {
                    assert_eq!(self.nodes[child].color, Color::Black, "red node with red child");
                }
                let (lo, hi) = if slot == 0 {
                    (lower, Some(&node.key))
                } else {
                    (Some(&node.key), upper)
                };
                heights[slot] = self.assert_subtree(child, lo, hi, seen);
            }
        }
        assert_eq!(heights[0], heights[1], "black-height mismatch under {:?}", node.key);
        let expected = A::summarize(
            &node.key,
            &node.value,
            node.left.map(|l| &self.nodes[l].summary),
            node.right.map(|r| &self.nodes[r].summary),
        );
        assert_eq!(node.summary, expected, "stale summary at {:?}", node.key);
        heights[0] + usize::from(node.color == Color::Black)
    }
}

impl<K: Ord + fmt::Debug, V: fmt::Debug, A: Augment<K, V>> fmt::Debug for BalancedTree<K, V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
