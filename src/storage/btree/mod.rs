#![forbid(unsafe_code)]

//! Copy-on-write B+tree over fixed-size pages.
//!
//! The algorithms here are generic over where pages come from. Readers pass
//! a [`PageSource`] that borrows straight out of the memory map; writers pass
//! a [`PageStore`] that also knows how to copy, allocate and free pages.
//! Positions are kept in a [`CursorState`], a stack of `(page, index)` pairs
//! from the root to a leaf plus an optional position inside a duplicate set.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::primitives::pager::page;
use crate::types::{KvError, PageId, Result, MAX_KEY_SIZE};

mod cursor;
mod del;
mod dup;
mod put;
mod stats;

pub use cursor::{
    count, current, current_flags, descend, first, first_dup, get_both, get_both_range, last,
    last_dup, next, next_dup, next_nodup, prev, prev_dup, prev_nodup, seek_item, set, set_range,
    Item, Target,
};
pub use del::{del, free_tree};
pub use dup::DupSet;
pub use put::{put, PutMode};
pub use stats::{BTreeStats, BTreeStatsSnapshot};

pub use crate::primitives::pager::DbRecord;

/// Key or value ordering function.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// Fill factor (per mille) below which a page is rebalanced.
pub const FILL_THRESHOLD: usize = 250;

/// Plain byte-wise ordering.
pub fn cmp_lex(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Byte-wise ordering starting from the last byte.
pub fn cmp_reverse(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Ordering of native-endian `u32` or `u64` values.
pub fn cmp_int(a: &[u8], b: &[u8]) -> Ordering {
    match (a.len(), b.len()) {
        (4, 4) => u32::from_ne_bytes([a[0], a[1], a[2], a[3]])
            .cmp(&u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        (8, 8) => native_u64(a).cmp(&native_u64(b)),
        (la, lb) => la.cmp(&lb).then_with(|| a.cmp(b)),
    }
}

fn native_u64(b: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    u64::from_ne_bytes(arr)
}

/// How the values of a duplicate-sorted database are ordered and stored.
#[derive(Clone, Copy)]
pub struct DupCfg {
    /// Ordering of values under one key.
    pub cmp: CompareFn,
    /// All values share one size and sub-pages use the LEAF2 layout.
    pub fixed: bool,
}

/// Shape of a tree as seen by the algorithms.
#[derive(Clone, Copy)]
pub struct TreeCfg {
    /// Key ordering.
    pub cmp: CompareFn,
    /// Key width when leaves use the LEAF2 layout (sub-trees of fixed-size
    /// duplicates).
    pub leaf2: Option<usize>,
    /// Present for duplicate-sorted databases.
    pub dup: Option<DupCfg>,
}

impl TreeCfg {
    /// Plain tree ordered by `cmp`.
    pub fn plain(cmp: CompareFn) -> Self {
        Self {
            cmp,
            leaf2: None,
            dup: None,
        }
    }

    /// Configuration of the sub-tree holding the values of one key.
    pub(crate) fn sub_tree(&self, db: &DbRecord) -> Option<TreeCfg> {
        self.dup.map(|dup| TreeCfg {
            cmp: dup.cmp,
            leaf2: (dup.fixed && db.pad > 0).then_some(db.pad as usize),
            dup: None,
        })
    }
}

/// Largest node stored inline on a leaf; bigger items go to overflow pages.
pub fn node_max(page_size: usize) -> usize {
    (((page_size - page::PAGE_HDR) / 2) & !1) - 2
}

/// Largest key (and duplicate value) accepted for the page size.
pub fn max_key_size(page_size: usize) -> usize {
    MAX_KEY_SIZE.min(node_max(page_size) - 16)
}

/// Source of committed or in-flight pages.
pub trait PageSource {
    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Borrows `count` consecutive pages starting at `pgno`.
    fn pages(&self, pgno: PageId, count: usize) -> Result<&[u8]>;

    /// Borrows one page.
    fn page(&self, pgno: PageId) -> Result<&[u8]> {
        self.pages(pgno, 1)
    }

    /// Borrows a whole overflow run.
    fn run(&self, pgno: PageId) -> Result<&[u8]> {
        let first = self.page(pgno)?;
        if !page::flags(first).contains(page::PageFlags::OVERFLOW) {
            return Err(KvError::Corruption("expected overflow page"));
        }
        let count = page::overflow_pages(first);
        if count == 0 {
            return Err(KvError::Corruption("empty overflow run"));
        }
        self.pages(pgno, count)
    }
}

/// Page access for a write transaction.
pub trait PageStore: PageSource {
    /// Mutable access to a page already dirty in the current transaction.
    /// For the first page of an overflow run the slice covers the whole run.
    fn page_mut(&mut self, pgno: PageId) -> Result<&mut [u8]>;

    /// Whether `pgno` can be modified in place.
    fn is_dirty(&self, pgno: PageId) -> bool;

    /// Makes `pgno` writable, returning the page number of the writable copy.
    fn touch(&mut self, pgno: PageId) -> Result<PageId>;

    /// Allocates `count` consecutive zeroed dirty pages.
    fn alloc(&mut self, count: usize) -> Result<PageId>;

    /// Releases `count` pages starting at `pgno`.
    fn free(&mut self, pgno: PageId, count: usize) -> Result<()>;

    /// Engine counters.
    fn stats(&self) -> &BTreeStats;
}

/// Root-to-leaf stack of `(page, index)` pairs.
pub type Path = SmallVec<[(PageId, u16); 8]>;

/// Position inside the duplicate set of the current key.
#[derive(Clone, Debug)]
pub enum DupPos {
    /// Index into an inline sub-page.
    Inline(u16),
    /// Path inside a duplicate sub-tree.
    Tree(Path),
}

/// Position of a cursor within one tree.
#[derive(Clone, Debug, Default)]
pub struct CursorState {
    /// Pages from the root down to the current leaf.
    pub path: Path,
    /// Duplicate position, `None` when the item is not a duplicate set.
    pub dup: Option<DupPos>,
    /// The cursor points at an item or has run past the end.
    pub initialized: bool,
    /// The cursor ran past the last item.
    pub eof: bool,
    /// The item under the cursor was deleted and the cursor rests on the
    /// following one.
    pub after_delete: bool,
    /// Set with `after_delete` when the following item belongs to a
    /// different key than the deleted one.
    pub delete_moved_key: bool,
}

impl CursorState {
    /// Forgets the position.
    pub fn reset(&mut self) {
        *self = CursorState::default();
    }

    /// Whether the cursor points at an item.
    pub fn on_item(&self) -> bool {
        self.initialized && !self.eof
    }
}

fn push(path: &mut Path, pgno: PageId, idx: usize) -> Result<()> {
    if path.len() >= crate::types::CURSOR_STACK {
        return Err(KvError::CursorFull);
    }
    path.push((pgno, idx as u16));
    Ok(())
}
