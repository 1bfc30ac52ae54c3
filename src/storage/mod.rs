//! Tree algorithms and the bookkeeping that sits on top of raw pages.

/// Copy-on-write B+tree: search, cursors, insert/split, delete/rebalance
/// and sorted duplicates.
pub mod btree;

/// Page reuse through the FREE database.
pub mod freelist;

/// Reader table and snapshot pinning.
pub mod mvcc;

pub use btree::{BTreeStats, BTreeStatsSnapshot, DbRecord};
pub use mvcc::{ReaderInfo, ReaderRegistry};
