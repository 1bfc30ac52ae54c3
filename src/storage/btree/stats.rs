use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use serde::Serialize;

/// Snapshot of engine counters at a point in time.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct BTreeStatsSnapshot {
    /// Leaf page splits.
    pub leaf_splits: u64,
    /// Branch page splits.
    pub branch_splits: u64,
    /// Page merges during rebalance.
    pub merges: u64,
    /// Nodes moved between siblings during rebalance.
    pub node_moves: u64,
    /// Dirty pages written out early by spilling.
    pub spilled_pages: u64,
    /// Free-list records pulled into a writer's reuse set.
    pub reclaimed_records: u64,
    /// Duplicate sets promoted from an inline sub-page to a sub-tree.
    pub dup_promotions: u64,
}

/// Thread-safe engine counters shared by every transaction of an environment.
#[derive(Default)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    branch_splits: AtomicU64,
    merges: AtomicU64,
    node_moves: AtomicU64,
    spilled_pages: AtomicU64,
    reclaimed_records: AtomicU64,
    dup_promotions: AtomicU64,
}

impl BTreeStats {
    pub(crate) fn record_split(&self, branch: bool) {
        if branch {
            self.branch_splits.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub(crate) fn record_merge(&self) {
        self.merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_node_move(&self) {
        self.node_moves.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_spill(&self, pages: u64) {
        self.spilled_pages.fetch_add(pages, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_reclaim(&self) {
        self.reclaimed_records.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn record_dup_promotion(&self) {
        self.dup_promotions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Returns the current count of leaf splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of branch splits.
    pub fn branch_splits(&self) -> u64 {
        self.branch_splits.load(AtomicOrdering::Relaxed)
    }

    /// Captures every counter.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            branch_splits: self.branch_splits(),
            merges: self.merges.load(AtomicOrdering::Relaxed),
            node_moves: self.node_moves.load(AtomicOrdering::Relaxed),
            spilled_pages: self.spilled_pages.load(AtomicOrdering::Relaxed),
            reclaimed_records: self.reclaimed_records.load(AtomicOrdering::Relaxed),
            dup_promotions: self.dup_promotions.load(AtomicOrdering::Relaxed),
        }
    }
}
