//! Cursors over one database of a transaction.
//!
//! A read-only cursor hands out slices of the memory map. A write cursor
//! lives in its transaction's cursor table so that writes made through
//! other cursors or through the transaction keep it on its item; it hands
//! out owned copies.

use super::config::{DbFlags, WriteFlags};
use super::env::Database;
use super::txn::{check_sizes, owned_item, put_mode, RoTxn, RwTxn, WriteState};
use crate::primitives::pager::page;
use crate::storage::btree::{self, CursorState, DbRecord, Item, TreeCfg};
use crate::types::{KvError, Result, MAIN_DBI};

/// Cursor of a [`RoTxn`].
pub struct RoCursor<'t> {
    txn: &'t RoTxn,
    rec: DbRecord,
    cfg: TreeCfg,
    st: CursorState,
}

impl<'t> RoCursor<'t> {
    pub(crate) fn new(txn: &'t RoTxn, rec: DbRecord, cfg: TreeCfg) -> Self {
        Self {
            txn,
            rec,
            cfg,
            st: CursorState::default(),
        }
    }

    /// First item.
    pub fn first(&mut self) -> Result<Option<Item<'t>>> {
        btree::first(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// Last item.
    pub fn last(&mut self) -> Result<Option<Item<'t>>> {
        btree::last(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// Item under the cursor.
    pub fn get_current(&self) -> Result<Option<Item<'t>>> {
        btree::current(self.txn, &self.st)
    }

    /// Next item, including further duplicates of the current key.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Item<'t>>> {
        btree::next(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// Previous item.
    pub fn prev(&mut self) -> Result<Option<Item<'t>>> {
        btree::prev(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// First item of the next key.
    pub fn next_nodup(&mut self) -> Result<Option<Item<'t>>> {
        btree::next_nodup(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// Last item of the previous key.
    pub fn prev_nodup(&mut self) -> Result<Option<Item<'t>>> {
        btree::prev_nodup(self.txn, &self.rec, &self.cfg, &mut self.st)
    }

    /// Next value of the current key.
    pub fn next_dup(&mut self) -> Result<Option<Item<'t>>> {
        btree::next_dup(self.txn, &mut self.st)
    }

    /// Previous value of the current key.
    pub fn prev_dup(&mut self) -> Result<Option<Item<'t>>> {
        btree::prev_dup(self.txn, &mut self.st)
    }

    /// First value of the current key.
    pub fn first_dup(&mut self) -> Result<Option<Item<'t>>> {
        btree::first_dup(self.txn, &self.cfg, &mut self.st)
    }

    /// Last value of the current key.
    pub fn last_dup(&mut self) -> Result<Option<Item<'t>>> {
        btree::last_dup(self.txn, &self.cfg, &mut self.st)
    }

    /// Positions on `key`.
    pub fn set(&mut self, key: &[u8]) -> Result<Option<Item<'t>>> {
        btree::set(self.txn, &self.rec, &self.cfg, &mut self.st, key)
    }

    /// Positions on the first key not below `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Item<'t>>> {
        btree::set_range(self.txn, &self.rec, &self.cfg, &mut self.st, key)
    }

    /// Positions on the exact key/value pair.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Item<'t>>> {
        btree::get_both(self.txn, &self.rec, &self.cfg, &mut self.st, key, value)
    }

    /// Positions on `key` and its first value not below `value`.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Item<'t>>> {
        btree::get_both_range(self.txn, &self.rec, &self.cfg, &mut self.st, key, value)
    }

    /// Number of values of the current key.
    pub fn count(&self) -> Result<u64> {
        btree::count(self.txn, &self.cfg, &self.st)
    }

    /// Node flags of the current item; `SUBDATA` marks a database record.
    pub(crate) fn node_flags(&self) -> Result<page::NodeFlags> {
        btree::current_flags(self.txn, &self.st)
    }

    /// Iterates from the current position (or the first item) forward.
    pub fn iter(&mut self) -> Iter<'_, 't> {
        Iter {
            cursor: self,
            started: false,
        }
    }
}

/// Forward iterator over a [`RoCursor`].
pub struct Iter<'c, 't> {
    cursor: &'c mut RoCursor<'t>,
    started: bool,
}

impl<'t> Iterator for Iter<'_, 't> {
    type Item = Result<Item<'t>>;

    fn next(&mut self) -> Option<Self::Item> {
        let step = if !self.started && self.cursor.st.on_item() {
            self.cursor.get_current()
        } else {
            self.cursor.next()
        };
        self.started = true;
        step.transpose()
    }
}

type Owned = Option<(Vec<u8>, Vec<u8>)>;

/// Cursor of a [`RwTxn`].
pub struct RwCursor<'t> {
    txn: &'t RwTxn,
    slot: usize,
}

impl<'t> RwCursor<'t> {
    pub(crate) fn new(txn: &'t RwTxn, slot: usize) -> Self {
        Self { txn, slot }
    }

    fn step(
        &mut self,
        op: impl FnOnce(&WriteState, &DbRecord, &TreeCfg, &mut CursorState) -> Result<Owned>,
    ) -> Result<Owned> {
        self.txn.state.borrow_mut().with_cursor(self.slot, op)
    }

    /// First item.
    pub fn first(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::first(s, rec, cfg, st)?)))
    }

    /// Last item.
    pub fn last(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::last(s, rec, cfg, st)?)))
    }

    /// Item under the cursor.
    pub fn get_current(&mut self) -> Result<Owned> {
        self.step(|s, _, _, st| Ok(owned_item(btree::current(s, st)?)))
    }

    /// Next item, including further duplicates of the current key.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::next(s, rec, cfg, st)?)))
    }

    /// Previous item.
    pub fn prev(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::prev(s, rec, cfg, st)?)))
    }

    /// First item of the next key.
    pub fn next_nodup(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::next_nodup(s, rec, cfg, st)?)))
    }

    /// Last item of the previous key.
    pub fn prev_nodup(&mut self) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::prev_nodup(s, rec, cfg, st)?)))
    }

    /// Next value of the current key.
    pub fn next_dup(&mut self) -> Result<Owned> {
        self.step(|s, _, _, st| Ok(owned_item(btree::next_dup(s, st)?)))
    }

    /// Previous value of the current key.
    pub fn prev_dup(&mut self) -> Result<Owned> {
        self.step(|s, _, _, st| Ok(owned_item(btree::prev_dup(s, st)?)))
    }

    /// First value of the current key.
    pub fn first_dup(&mut self) -> Result<Owned> {
        self.step(|s, _, cfg, st| Ok(owned_item(btree::first_dup(s, cfg, st)?)))
    }

    /// Last value of the current key.
    pub fn last_dup(&mut self) -> Result<Owned> {
        self.step(|s, _, cfg, st| Ok(owned_item(btree::last_dup(s, cfg, st)?)))
    }

    /// Positions on `key`.
    pub fn set(&mut self, key: &[u8]) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::set(s, rec, cfg, st, key)?)))
    }

    /// Positions on the first key not below `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::set_range(s, rec, cfg, st, key)?)))
    }

    /// Positions on the exact key/value pair.
    pub fn get_both(&mut self, key: &[u8], value: &[u8]) -> Result<Owned> {
        self.step(|s, rec, cfg, st| Ok(owned_item(btree::get_both(s, rec, cfg, st, key, value)?)))
    }

    /// Positions on `key` and its first value not below `value`.
    pub fn get_both_range(&mut self, key: &[u8], value: &[u8]) -> Result<Owned> {
        self.step(|s, rec, cfg, st| {
            Ok(owned_item(btree::get_both_range(s, rec, cfg, st, key, value)?))
        })
    }

    /// Number of values of the current key.
    pub fn count(&mut self) -> Result<u64> {
        self.txn
            .state
            .borrow_mut()
            .with_cursor(self.slot, |s, _, cfg, st| btree::count(s, cfg, st))
    }

    /// Stores an item and leaves the cursor on it. With
    /// [`WriteFlags::CURRENT`] the item under the cursor is replaced and
    /// `key` must equal its key.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.contains(WriteFlags::RESERVE) {
            return Err(KvError::Invalid("use RwTxn::put_reserve to reserve space"));
        }
        let dbi = self.txn.state.borrow().cursor_dbi(self.slot)?;
        let db_flags = self.txn.db_flags(Database(dbi))?;
        if !db_flags.contains(DbFlags::DUP_SORT)
            && flags.intersects(WriteFlags::NO_DUP_DATA | WriteFlags::APPEND_DUP)
        {
            return Err(KvError::Incompatible("flag needs a dup-sorted database"));
        }
        check_sizes(db_flags, key, data)?;
        let mode = put_mode(flags);
        let extra = page::overflow_count(self.txn.page_size(), data.len());
        self.txn.state.borrow_mut().mutate(dbi, Some(self.slot), extra, |s, rec, cfg, st| {
            btree::put(s, rec, cfg, st, key, data, mode)
        })
    }

    /// Deletes the item under the cursor, or every value of its key when
    /// `all_dups` is set. The cursor then rests on the following item:
    /// [`RwCursor::next`] returns it, [`RwCursor::prev`] the one before.
    pub fn del(&mut self, all_dups: bool) -> Result<()> {
        let mut state = self.txn.state.borrow_mut();
        let dbi = state.cursor_dbi(self.slot)?;
        state.mutate(dbi, Some(self.slot), 0, |s, rec, cfg, st| {
            if dbi == MAIN_DBI
                && st.on_item()
                && btree::current_flags(&*s, st)?.contains(page::NodeFlags::SUBDATA)
            {
                return Err(KvError::Incompatible("key names a database; drop it instead"));
            }
            btree::del(s, rec, cfg, st, all_dups)
        })
    }
}

impl Drop for RwCursor<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.txn.state.try_borrow_mut() {
            state.close_cursor(self.slot);
        }
    }
}
