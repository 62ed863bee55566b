#![forbid(unsafe_code)]

//! Interval tree keyed by lower bound.
//!
//! Intervals are half-open, `[low, high)`. Each node caches the largest upper
//! bound found in its subtree, which lets an overlap query skip every subtree
//! that ends before the query starts.

use std::fmt;

use crate::storage::rbtree::{Augment, BalancedTree, NodeIdx};
use crate::types::{Result, SombraError};

/// Upper bound and payload stored next to each lower bound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Span<I, V> {
    high: I,
    value: V,
}

/// Keeps the largest `high` of each subtree.
#[derive(Copy, Clone, Debug, Default)]
pub struct MaxHigh;

impl<I: Ord + Copy, V> Augment<I, Span<I, V>> for MaxHigh {
    type Summary = I;

    fn summarize(_low: &I, span: &Span<I, V>, left: Option<&I>, right: Option<&I>) -> I {
        let mut max = span.high;
        for bound in [left, right].into_iter().flatten() {
            if *bound > max {
                max = *bound;
            }
        }
        max
    }
}

/// One stored interval, borrowed from the tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interval<'a, I, V> {
    /// Inclusive lower bound.
    pub low: I,
    /// Exclusive upper bound.
    pub high: I,
    /// Payload.
    pub value: &'a V,
}

/// Set of non-identical-lower-bound intervals with overlap queries.
pub struct IntervalTree<I, V>
where
    I: Ord + Copy,
{
    tree: BalancedTree<I, Span<I, V>, MaxHigh>,
}

impl<I: Ord + Copy, V> Default for IntervalTree<I, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Ord + Copy, V> IntervalTree<I, V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            tree: BalancedTree::new(),
        }
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Returns true if no interval is stored.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Drops every interval.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Stores `[low, high) -> value`.
    ///
    /// Fails with [`SombraError::Invalid`] for an empty interval and with
    /// [`SombraError::DuplicateInterval`] if an interval already starts at `low`;
    /// the tree is unchanged in both cases.
    pub fn insert(&mut self, low: I, high: I, value: V) -> Result<()> {
        if low >= high {
            return Err(SombraError::Invalid("interval must satisfy low < high"));
        }
        if self.tree.insert(low, Span { high, value })? {
            Ok(())
        } else {
            Err(SombraError::DuplicateInterval)
        }
    }

    /// Removes `[low, high)` and returns its payload.
    ///
    /// Nothing happens if no interval starts at `low` or if the one that does has a
    /// different upper bound.
    pub fn remove(&mut self, low: I, high: I) -> Result<Option<V>> {
        match self.tree.get(&low) {
            Some(span) if span.high == high => {}
            _ => return Ok(None),
        }
        Ok(self.tree.remove(&low)?.map(|(_, span)| span.value))
    }

    /// Returns the interval starting at `low`.
    pub fn get(&self, low: I) -> Option<Interval<'_, I, V>> {
        self.tree.get(&low).map(|span| Interval {
            low,
            high: span.high,
            value: &span.value,
        })
    }

    /// Every stored interval overlapping `[low, high)`, in ascending `low` order.
    pub fn query(&self, low: I, high: I) -> Vec<Interval<'_, I, V>> {
        let mut hits = Vec::new();
        if low < high {
            self.collect(self.tree.root_idx(), low, high, &mut hits);
        }
        hits
    }

    /// All intervals in ascending `low` order.
    pub fn iter(&self) -> impl Iterator<Item = Interval<'_, I, V>> + '_ {
        self.tree.iter().map(|(low, span)| Interval {
            low: *low,
            high: span.high,
            value: &span.value,
        })
    }

    fn collect<'a>(
        &'a self,
        idx: Option<NodeIdx>,
        low: I,
        high: I,
        hits: &mut Vec<Interval<'a, I, V>>,
    ) {
        let Some(idx) = idx else {
            return;
        };
        let node = self.tree.view(idx);
        // Everything below ends at or before `low`.
        if *node.summary <= low {
            return;
        }
        self.collect(node.left, low, high, hits);
        if *node.key < high && low < node.value.high {
            hits.push(Interval {
                low: *node.key,
                high: node.value.high,
                value: &node.value.value,
            });
        }
        // Right subtree starts after this node; useless once this node starts past the query.
        if *node.key < high {
            self.collect(node.right, low, high, hits);
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self)
    where
        I: fmt::Debug,
    {
        self.tree.assert_invariants();
    }
}

impl<I: Ord + Copy + fmt::Debug, V: fmt::Debug> fmt::Debug for IntervalTree<I, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|i| (i.low..i.high, i.value)))
            .finish()
    }
}
