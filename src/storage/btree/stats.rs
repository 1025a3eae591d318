use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of tree counters at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BTreeStats {
    /// Root-to-leaf descents.
    pub searches: u64,
    /// Leaf buckets split because an insert overflowed them.
    pub leaf_splits: u64,
    /// Internal buckets split because a separator overflowed them.
    pub internal_splits: u64,
    /// Bucket pairs merged after an underflow.
    pub merges: u64,
    /// Underflows fixed by moving cells from a sibling.
    pub redistributions: u64,
    /// Record id replacements applied without rewriting the bucket.
    pub in_place_updates: u64,
    /// Times the root lost its last separator and absorbed its only child.
    pub root_collapses: u64,
}

/// Thread-safe counters behind [`BTreeStats`].
#[derive(Default)]
pub(crate) struct BTreeCounters {
    searches: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    merges: AtomicU64,
    redistributions: AtomicU64,
    in_place_updates: AtomicU64,
    root_collapses: AtomicU64,
}

impl BTreeCounters {
    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_split(&self, leaf: bool) {
        let counter = if leaf {
            &self.leaf_splits
        } else {
            &self.internal_splits
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_merges(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_redistributions(&self) {
        self.redistributions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_in_place_updates(&self) {
        self.in_place_updates.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BTreeStats {
        BTreeStats {
            searches: self.searches.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            merges: self.merges.load(AtomicOrdering::Relaxed),
            redistributions: self.redistributions.load(AtomicOrdering::Relaxed),
            in_place_updates: self.in_place_updates.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
        }
    }
}

impl BTreeStats {
    /// Emits the snapshot to the tracing infrastructure.
    pub fn emit_tracing(&self, tree: &str) {
        tracing::info!(
            target: "cellstore::btree::stats",
            tree,
            searches = self.searches,
            leaf_splits = self.leaf_splits,
            internal_splits = self.internal_splits,
            merges = self.merges,
            redistributions = self.redistributions,
            in_place_updates = self.in_place_updates,
            root_collapses = self.root_collapses,
            "btree stats snapshot"
        );
    }
}

/// Shape of a tree as verified by a full structural check.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TreeShape {
    /// Non-null entries found in leaves.
    pub entries: u64,
    /// Values stored under the null key.
    pub null_entries: u64,
    /// Levels from root to leaves, 1 for a lone root leaf.
    pub depth: u32,
    /// Reachable leaf buckets.
    pub leaf_buckets: u64,
    /// Reachable internal buckets.
    pub internal_buckets: u64,
    /// Pages parked on the free list.
    pub free_buckets: u64,
    /// Pages in the data file, entry point included.
    pub file_pages: u64,
}
