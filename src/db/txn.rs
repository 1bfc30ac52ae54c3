use std::cell::RefCell;
use std::io::IoSlice;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::config::{DbFlags, Synchronous, WriteFlags};
use super::cursor::{RoCursor, RwCursor};
use super::env::{Database, EnvInner};
use crate::primitives::concurrency::WriterGuard;
use crate::primitives::io::FileIo;
use crate::primitives::map::Map;
use crate::primitives::pager::page::{self, NodeFlags};
use crate::primitives::pager::{decode_meta, encode_meta, Meta};
use crate::storage::btree::{
    self, BTreeStats, CursorState, DbRecord, PageSource, PageStore, PutMode, TreeCfg,
};
use crate::storage::freelist::{self, reclaim_next, FreeListStore, FreeState};
use crate::storage::mvcc::ReaderSlot;
use crate::types::{KvError, PageId, Result, TxnId, FREE_DBI, MAIN_DBI};

/// Attempts a reader makes to catch a consistent meta page.
const PIN_RETRIES: usize = 1000;

/// Shape and size of one database.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Stat {
    /// Page size.
    pub page_size: u32,
    /// Tree depth.
    pub depth: u16,
    /// Branch pages.
    pub branch_pages: u64,
    /// Leaf pages.
    pub leaf_pages: u64,
    /// Overflow pages.
    pub overflow_pages: u64,
    /// Items, counting every duplicate.
    pub entries: u64,
}

impl Stat {
    fn of(rec: &DbRecord, page_size: usize) -> Self {
        Self {
            page_size: page_size as u32,
            depth: rec.depth,
            branch_pages: rec.branch_pages,
            leaf_pages: rec.leaf_pages,
            overflow_pages: rec.overflow_pages,
            entries: rec.entries,
        }
    }
}

pub(crate) fn put_mode(flags: WriteFlags) -> PutMode {
    PutMode {
        no_overwrite: flags.contains(WriteFlags::NO_OVERWRITE),
        no_dup_data: flags.contains(WriteFlags::NO_DUP_DATA),
        current: flags.contains(WriteFlags::CURRENT),
        append: flags.contains(WriteFlags::APPEND),
        append_dup: flags.contains(WriteFlags::APPEND_DUP),
        node_flags: NodeFlags::empty(),
    }
}

/// Size checks that depend on database flags rather than tree shape.
pub(crate) fn check_sizes(flags: DbFlags, key: &[u8], data: &[u8]) -> Result<()> {
    let int_len = |n: usize| n == 4 || n == 8;
    if flags.contains(DbFlags::INTEGER_KEY) && !int_len(key.len()) {
        return Err(KvError::BadValSize);
    }
    if flags.contains(DbFlags::DUP_SORT | DbFlags::INTEGER_DUP) && !int_len(data.len()) {
        return Err(KvError::BadValSize);
    }
    Ok(())
}

/// Looks up the record of named database `name` in MAIN.
fn lookup_named<S: PageSource + ?Sized>(
    src: &S,
    main: &DbRecord,
    main_cfg: &TreeCfg,
    name: &str,
) -> Result<Option<DbRecord>> {
    let mut st = CursorState::default();
    let Some((_, value)) = btree::set(src, main, main_cfg, &mut st, name.as_bytes())? else {
        return Ok(None);
    };
    if !btree::current_flags(src, &st)?.contains(NodeFlags::SUBDATA) {
        return Err(KvError::Incompatible("key in the main database is not a database"));
    }
    DbRecord::decode(value).map(Some)
}

/// Copies a borrowed item out of the page it lives on.
pub(crate) fn owned_item(item: Option<btree::Item<'_>>) -> Option<(Vec<u8>, Vec<u8>)> {
    item.map(|(k, v)| (k.to_vec(), v.to_vec()))
}

/// A read-only snapshot.
///
/// Items returned by [`RoTxn::get`] and [`RoCursor`] borrow the memory
/// map and stay valid for the life of the transaction.
pub struct RoTxn {
    env: Arc<EnvInner>,
    map: Arc<Map>,
    meta: Meta,
    slot: ReaderSlot,
    dbs: RefCell<FxHashMap<u32, DbRecord>>,
}

impl RoTxn {
    pub(crate) fn begin(env: Arc<EnvInner>) -> Result<Self> {
        env.check_usable()?;
        let slot = env.readers.acquire()?;
        for _ in 0..PIN_RETRIES {
            let txnid = slot.pin();
            let meta_slot = Meta::slot_for(TxnId(txnid));
            let map = env.map_covering(2, 0)?;
            let meta = match decode_meta(map.pages_at(PageId(meta_slot), 1)?, meta_slot) {
                Ok(meta) if meta.txnid.0 == txnid => meta,
                _ => continue,
            };
            let map = env.map_covering(meta.last_pgno.0 + 1, meta.map_size)?;
            env.txn_started();
            trace!(txnid, slot = slot.index(), "txn.begin_ro");
            return Ok(Self {
                env,
                map,
                meta,
                slot,
                dbs: RefCell::new(FxHashMap::default()),
            });
        }
        Err(KvError::Corruption("no meta page matches the committed txnid"))
    }

    /// Snapshot id.
    pub fn id(&self) -> u64 {
        self.meta.txnid.0
    }

    fn record(&self, dbi: u32) -> Result<DbRecord> {
        match dbi {
            FREE_DBI => return Ok(self.meta.free),
            MAIN_DBI => return Ok(self.meta.main),
            _ => {}
        }
        if let Some(rec) = self.dbs.borrow().get(&dbi) {
            return Ok(*rec);
        }
        let slot = self.env.slot(dbi)?;
        let name = slot.name.ok_or(KvError::BadDbi)?;
        let main_cfg = self.main_cfg()?;
        let rec = lookup_named(self, &self.meta.main, &main_cfg, &name)?.ok_or(KvError::BadDbi)?;
        self.dbs.borrow_mut().insert(dbi, rec);
        Ok(rec)
    }

    fn main_cfg(&self) -> Result<TreeCfg> {
        Ok(self.env.slot(MAIN_DBI)?.tree_cfg(self.meta.main.flags))
    }

    pub(crate) fn db(&self, db: Database) -> Result<(DbRecord, TreeCfg)> {
        let rec = self.record(db.0)?;
        let cfg = self.env.slot(db.0)?.tree_cfg(rec.flags);
        Ok((rec, cfg))
    }

    /// Opens a database that exists in this snapshot. `None` names the
    /// main database.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.env.check_usable()?;
        if flags.contains(DbFlags::CREATE) {
            return Err(KvError::Invalid("cannot create a database in a read-only transaction"));
        }
        let Some(name) = name else {
            let stored = DbFlags::from_record(self.meta.main.flags);
            if !flags.persistent().is_empty() && flags.persistent() != stored {
                return Err(KvError::Incompatible("database flags differ from the stored ones"));
            }
            return Ok(Database::MAIN);
        };
        let main_cfg = self.main_cfg()?;
        let rec = lookup_named(self, &self.meta.main, &main_cfg, name)?.ok_or(KvError::NotFound)?;
        let dbi = self
            .env
            .register_db(name, flags, Some(DbFlags::from_record(rec.flags)))?;
        self.dbs.borrow_mut().insert(dbi, rec);
        Ok(Database(dbi))
    }

    /// Value stored under `key`; the first value for dup-sort databases.
    pub fn get(&self, db: Database, key: &[u8]) -> Result<Option<&[u8]>> {
        let (rec, cfg) = self.db(db)?;
        let mut st = CursorState::default();
        Ok(btree::set(self, &rec, &cfg, &mut st, key)?.map(|(_, v)| v))
    }

    /// Opens a cursor over `db`.
    pub fn cursor(&self, db: Database) -> Result<RoCursor<'_>> {
        let (rec, cfg) = self.db(db)?;
        Ok(RoCursor::new(self, rec, cfg))
    }

    /// Statistics of `db` in this snapshot.
    pub fn stat(&self, db: Database) -> Result<Stat> {
        Ok(Stat::of(&self.record(db.0)?, self.env.page_size))
    }

    /// Persistent flags of `db`.
    pub fn db_flags(&self, db: Database) -> Result<DbFlags> {
        Ok(DbFlags::from_record(self.record(db.0)?.flags))
    }

    /// Ends the snapshot. Equivalent to dropping it.
    pub fn abort(self) {}

    /// Ends the snapshot; read-only transactions have nothing to commit.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    pub(crate) fn meta(&self) -> &Meta {
        &self.meta
    }

    pub(crate) fn map(&self) -> &Map {
        &self.map
    }

    /// Looks up a named database record without registering a handle.
    pub(crate) fn named_record(&self, name: &str) -> Result<Option<DbRecord>> {
        let main_cfg = self.main_cfg()?;
        lookup_named(self, &self.meta.main, &main_cfg, name)
    }

    /// Cursor over an arbitrary tree of this snapshot.
    pub(crate) fn raw_cursor(&self, rec: DbRecord, cfg: TreeCfg) -> RoCursor<'_> {
        RoCursor::new(self, rec, cfg)
    }
}

impl Drop for RoTxn {
    fn drop(&mut self) {
        self.env.txn_finished();
        trace!(txnid = self.meta.txnid.0, slot = self.slot.index(), "txn.end_ro");
    }
}

impl PageSource for RoTxn {
    fn page_size(&self) -> usize {
        self.env.page_size
    }

    fn pages(&self, pgno: PageId, count: usize) -> Result<&[u8]> {
        if count == 0 || pgno.0 + count as u64 - 1 > self.meta.last_pgno.0 {
            return Err(KvError::Corruption("page beyond the snapshot"));
        }
        self.map.pages_at(pgno, count)
    }
}

#[derive(Clone, Copy)]
struct DbState {
    rec: DbRecord,
    changed: bool,
}

/// Private state of one level of a write transaction.
#[derive(Default)]
struct Layer {
    dirty: FxHashMap<PageId, Vec<u8>>,
    dirty_pages: usize,
    spilled: FxHashSet<PageId>,
    /// Family pages released at this level; stale copies in the parent go
    /// away when this level commits.
    discarded: Vec<PageId>,
    free: FreeState,
    dbs: Vec<Option<DbState>>,
    next_pgno: u64,
    created: Vec<u32>,
    dropped: Vec<u32>,
    poisoned: bool,
}

struct CursorEntry {
    dbi: u32,
    st: CursorState,
}

enum Mark {
    Idle,
    End,
    At {
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        after_delete: bool,
        moved: bool,
    },
}

/// Everything a write transaction owns, shared by its cursors through a
/// `RefCell`.
pub(crate) struct WriteState {
    env: Arc<EnvInner>,
    map: Arc<Map>,
    psize: usize,
    txnid: u64,
    oldest: u64,
    max_pgno: u64,
    layers: Vec<Layer>,
    cursors: Vec<Option<CursorEntry>>,
    _guard: Option<WriterGuard>,
    finished: bool,
}

impl WriteState {
    fn top(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Layer {
        let i = self.layers.len() - 1;
        &mut self.layers[i]
    }

    fn check(&self) -> Result<()> {
        self.env.check_usable()?;
        if self.top().poisoned {
            return Err(KvError::BadTxn);
        }
        Ok(())
    }

    fn note_error(&mut self, err: &KvError) {
        self.env.note_error(err);
        if err.poisons_txn() && !self.top().poisoned {
            warn!(txnid = self.txnid, error = %err, "txn.poisoned");
            self.top_mut().poisoned = true;
        }
    }

    fn dirty_total(&self) -> usize {
        self.layers.iter().map(|l| l.dirty_pages).sum()
    }

    fn is_family(&self, pgno: PageId) -> bool {
        self.layers
            .iter()
            .any(|l| l.dirty.contains_key(&pgno) || l.spilled.contains(&pgno))
    }

    fn insert_dirty(&mut self, pgno: PageId, buf: Vec<u8>) -> Result<()> {
        let psize = self.psize;
        let pages = buf.len() / psize;
        if self.dirty_total() + pages > self.env.options.max_dirty_pages {
            return Err(KvError::TxnFull);
        }
        let top = self.top_mut();
        if let Some(old) = top.dirty.insert(pgno, buf) {
            top.dirty_pages -= old.len() / psize;
        }
        top.dirty_pages += pages;
        Ok(())
    }

    fn record(&mut self, dbi: u32) -> Result<DbRecord> {
        if let Some(Some(state)) = self.top().dbs.get(dbi as usize) {
            return Ok(state.rec);
        }
        let slot = self.env.slot(dbi)?;
        let name = slot.name.ok_or(KvError::BadDbi)?;
        let main = self.record(MAIN_DBI)?;
        let main_cfg = self.env.slot(MAIN_DBI)?.tree_cfg(main.flags);
        let rec = lookup_named(&*self, &main, &main_cfg, &name)?.ok_or(KvError::BadDbi)?;
        self.put_state(dbi, DbState { rec, changed: false });
        Ok(rec)
    }

    fn put_state(&mut self, dbi: u32, state: DbState) {
        let dbs = &mut self.top_mut().dbs;
        if dbs.len() <= dbi as usize {
            dbs.resize(dbi as usize + 1, None);
        }
        dbs[dbi as usize] = Some(state);
    }

    fn store_record(&mut self, dbi: u32, rec: DbRecord) {
        self.put_state(dbi, DbState { rec, changed: true });
    }

    fn cfg(&self, dbi: u32, rec: &DbRecord) -> Result<TreeCfg> {
        Ok(self.env.slot(dbi)?.tree_cfg(rec.flags))
    }

    fn bookmarks(&self, dbi: u32, own: Option<usize>) -> Result<Vec<(usize, Mark)>> {
        let mut marks = Vec::new();
        for (i, entry) in self.cursors.iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry.dbi != dbi || Some(i) == own {
                continue;
            }
            marks.push((i, self.mark_of(&entry.st)?));
        }
        Ok(marks)
    }

    fn mark_of(&self, st: &CursorState) -> Result<Mark> {
        if !st.initialized {
            return Ok(Mark::Idle);
        }
        if st.eof {
            return Ok(Mark::End);
        }
        Ok(match btree::current(self, st)? {
            Some((k, v)) => Mark::At {
                key: k.to_vec(),
                value: Some(v.to_vec()),
                after_delete: st.after_delete,
                moved: st.delete_moved_key,
            },
            None => Mark::Idle,
        })
    }

    fn restore(&mut self, rec: &DbRecord, cfg: &TreeCfg, marks: Vec<(usize, Mark)>) -> Result<()> {
        for (i, mark) in marks {
            let mut st = CursorState::default();
            match mark {
                Mark::Idle => {}
                Mark::End => {
                    if btree::last(&*self, rec, cfg, &mut st)?.is_some() {
                        st.eof = true;
                    }
                }
                Mark::At {
                    key,
                    value,
                    after_delete,
                    moved,
                } => {
                    let value = if cfg.dup.is_some() { value } else { None };
                    if btree::seek_item(&*self, rec, cfg, &mut st, &key, value.as_deref())? {
                        st.after_delete = after_delete;
                        st.delete_moved_key = moved;
                    } else if st.on_item() {
                        st.after_delete = true;
                        st.delete_moved_key = match btree::current(&*self, &st)? {
                            Some((k, _)) => !(cfg.cmp)(k, &key).is_eq(),
                            None => true,
                        };
                    }
                }
            }
            if let Some(Some(entry)) = self.cursors.get_mut(i) {
                entry.st = st;
            }
        }
        Ok(())
    }

    /// Runs a tree modification on `dbi`, then puts every other cursor on
    /// that database back on its item (or the item that replaced it).
    pub(crate) fn mutate<R>(
        &mut self,
        dbi: u32,
        own: Option<usize>,
        extra: usize,
        op: impl FnOnce(&mut WriteState, &mut DbRecord, &TreeCfg, &mut CursorState) -> Result<R>,
    ) -> Result<R> {
        self.check()?;
        let res = self.mutate_inner(dbi, own, extra, op);
        if let Err(err) = &res {
            self.note_error(err);
        }
        res
    }

    fn mutate_inner<R>(
        &mut self,
        dbi: u32,
        own: Option<usize>,
        extra: usize,
        op: impl FnOnce(&mut WriteState, &mut DbRecord, &TreeCfg, &mut CursorState) -> Result<R>,
    ) -> Result<R> {
        let mut rec = self.record(dbi)?;
        let cfg = self.cfg(dbi, &rec)?;
        let main_depth = self.record(MAIN_DBI)?.depth as usize;
        self.reserve(3 * (rec.depth as usize + main_depth + 2) + extra)?;
        let mut marks = self.bookmarks(dbi, own)?;
        let mut st = match own.and_then(|i| self.cursors.get_mut(i)) {
            Some(Some(entry)) => mem::take(&mut entry.st),
            _ => CursorState::default(),
        };
        let own_mark = match own {
            Some(i) => Some((i, self.mark_of(&st)?)),
            None => None,
        };
        let res = op(self, &mut rec, &cfg, &mut st);
        if let Some(Some(entry)) = own.and_then(|i| self.cursors.get_mut(i)) {
            entry.st = st;
        }
        self.store_record(dbi, rec);
        match res {
            Ok(out) => {
                self.restore(&rec, &cfg, marks)?;
                Ok(out)
            }
            // A failed write may have copied the path already; every cursor,
            // the caller's included, goes back to its item on the copies.
            Err(err) if !err.poisons_txn() => {
                marks.extend(own_mark);
                self.restore(&rec, &cfg, marks)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Runs a read-only cursor step on cursor `slot`.
    pub(crate) fn with_cursor<R>(
        &mut self,
        slot: usize,
        op: impl FnOnce(&WriteState, &DbRecord, &TreeCfg, &mut CursorState) -> Result<R>,
    ) -> Result<R> {
        self.check()?;
        let dbi = match self.cursors.get(slot) {
            Some(Some(entry)) => entry.dbi,
            _ => return Err(KvError::Invalid("cursor is closed")),
        };
        let rec = self.record(dbi)?;
        let cfg = self.cfg(dbi, &rec)?;
        let mut st = match self.cursors.get_mut(slot) {
            Some(Some(entry)) => mem::take(&mut entry.st),
            _ => CursorState::default(),
        };
        let res = op(&*self, &rec, &cfg, &mut st);
        if let Some(Some(entry)) = self.cursors.get_mut(slot) {
            entry.st = st;
        }
        res
    }

    pub(crate) fn cursor_dbi(&self, slot: usize) -> Result<u32> {
        match self.cursors.get(slot) {
            Some(Some(entry)) => Ok(entry.dbi),
            _ => Err(KvError::Invalid("cursor is closed")),
        }
    }

    pub(crate) fn open_cursor(&mut self, dbi: u32) -> Result<usize> {
        self.check()?;
        self.record(dbi)?;
        let entry = CursorEntry {
            dbi,
            st: CursorState::default(),
        };
        match self.cursors.iter().position(Option::is_none) {
            Some(i) => {
                self.cursors[i] = Some(entry);
                Ok(i)
            }
            None => {
                self.cursors.push(Some(entry));
                Ok(self.cursors.len() - 1)
            }
        }
    }

    pub(crate) fn close_cursor(&mut self, slot: usize) {
        if let Some(entry) = self.cursors.get_mut(slot) {
            *entry = None;
        }
    }

    fn reset_cursors(&mut self, dbi: u32) {
        for entry in self.cursors.iter_mut().flatten() {
            if entry.dbi == dbi {
                entry.st.reset();
            }
        }
    }

    /// Makes room for `need` more dirty pages, spilling if the cap would be
    /// exceeded.
    fn reserve(&mut self, need: usize) -> Result<()> {
        let cap = self.env.options.max_dirty_pages;
        let total = self.dirty_total();
        if total + need <= cap {
            return Ok(());
        }
        let want = (total / self.env.options.spill_divisor).max(total + need - cap);
        self.spill(want)?;
        if self.dirty_total() + need > cap {
            return Err(KvError::TxnFull);
        }
        Ok(())
    }

    /// Writes up to `want` dirty pages to the file and forgets their
    /// buffers, innermost level first. Pages already spilled by an outer
    /// level are skipped so an abort of this level cannot clobber them.
    fn spill(&mut self, want: usize) -> Result<usize> {
        let mut done = 0;
        for level in (0..self.layers.len()).rev() {
            if done >= want {
                break;
            }
            let (outer, rest) = self.layers.split_at(level);
            let mut pgnos: Vec<PageId> = rest[0]
                .dirty
                .keys()
                .copied()
                .filter(|p| !outer.iter().any(|l| l.spilled.contains(p)))
                .collect();
            pgnos.sort_unstable();
            for pgno in pgnos {
                if done >= want {
                    break;
                }
                let Some(buf) = self.layers[level].dirty.remove(&pgno) else {
                    continue;
                };
                self.write_out(pgno, &buf)?;
                let pages = buf.len() / self.psize;
                let layer = &mut self.layers[level];
                layer.dirty_pages -= pages;
                layer.spilled.insert(pgno);
                done += pages;
            }
        }
        self.env.stats.record_spill(done as u64);
        debug!(txnid = self.txnid, pages = done, "txn.spill");
        Ok(done)
    }

    fn write_out(&self, pgno: PageId, buf: &[u8]) -> Result<()> {
        let off = pgno.offset(self.psize);
        if self.env.writable_map() {
            self.map.write(off as usize, buf)
        } else {
            self.env.io.write_at(off, buf)
        }
    }

    fn sync(&self) -> Result<()> {
        if self.env.writable_map() {
            self.map.flush(false)
        } else {
            self.env.io.sync_data()
        }
    }

    fn begin_nested(&mut self) -> Result<()> {
        self.check()?;
        let top = self.top();
        let child = Layer {
            free: top.free.clone(),
            dbs: top.dbs.clone(),
            next_pgno: top.next_pgno,
            ..Layer::default()
        };
        self.layers.push(child);
        debug!(txnid = self.txnid, depth = self.layers.len(), "txn.begin_nested");
        Ok(())
    }

    fn commit_nested(&mut self) -> Result<()> {
        if self.layers.len() < 2 {
            return Err(KvError::Invalid("no nested transaction to commit"));
        }
        if self.top().poisoned {
            self.abort_nested();
            return Err(KvError::BadTxn);
        }
        let Some(child) = self.layers.pop() else {
            return Err(KvError::Invalid("no nested transaction to commit"));
        };
        let psize = self.psize;
        let parent = self.top_mut();
        let drop_page = |parent: &mut Layer, pgno: &PageId| {
            if let Some(old) = parent.dirty.remove(pgno) {
                parent.dirty_pages -= old.len() / psize;
            }
        };
        for pgno in &child.discarded {
            drop_page(parent, pgno);
            parent.spilled.remove(pgno);
        }
        for pgno in &child.spilled {
            drop_page(parent, pgno);
            parent.spilled.insert(*pgno);
        }
        for (pgno, buf) in child.dirty {
            parent.spilled.remove(&pgno);
            drop_page(parent, &pgno);
            parent.dirty_pages += buf.len() / psize;
            parent.dirty.insert(pgno, buf);
        }
        parent.free = child.free;
        parent.dbs = child.dbs;
        parent.next_pgno = child.next_pgno;
        parent.created.extend(child.created);
        parent.dropped.extend(child.dropped);
        debug!(txnid = self.txnid, depth = self.layers.len(), "txn.commit_nested");
        Ok(())
    }

    fn abort_nested(&mut self) {
        if self.layers.len() < 2 {
            return;
        }
        if let Some(child) = self.layers.pop() {
            self.env.withdraw(&child.created);
            for dbi in child.created.iter().chain(&child.dropped) {
                self.reset_cursors(*dbi);
            }
        }
        debug!(txnid = self.txnid, depth = self.layers.len(), "txn.abort_nested");
    }

    fn has_changes(&self) -> bool {
        let top = self.top();
        !top.dirty.is_empty()
            || !top.spilled.is_empty()
            || !top.free.free_pgs.is_empty()
            || !top.dropped.is_empty()
            || top.dbs.iter().flatten().any(|s| s.changed)
    }

    fn commit_top(&mut self) -> Result<()> {
        self.check()?;
        if self.layers.len() != 1 {
            return Err(KvError::Invalid("nested transaction still open"));
        }
        let res = self.write_commit();
        if let Err(err) = &res {
            self.note_error(err);
        }
        res
    }

    fn write_commit(&mut self) -> Result<()> {
        let named: Vec<(u32, DbRecord)> = self
            .top()
            .dbs
            .iter()
            .enumerate()
            .skip(2)
            .filter_map(|(i, s)| s.filter(|s| s.changed).map(|s| (i as u32, s.rec)))
            .collect();
        for (dbi, rec) in named {
            let name = self.env.slot(dbi)?.name.ok_or(KvError::BadDbi)?;
            self.mutate_inner(MAIN_DBI, None, 0, |s, main, cfg, st| {
                let mode = PutMode {
                    node_flags: NodeFlags::SUBDATA,
                    ..PutMode::default()
                };
                btree::put(s, main, cfg, st, name.as_bytes(), &rec.encode(), mode)
            })?;
        }
        if !self.has_changes() {
            debug!(txnid = self.txnid, "txn.commit_empty");
            return Ok(());
        }

        let free = self.record(FREE_DBI)?;
        let free_ids = {
            let state = &self.top().free;
            state.free_pgs.len()
                + state.loose.len()
                + state.reclaim.as_ref().map_or(0, |r| r.pghead.len())
        };
        let record_pages = 2 * page::overflow_count(self.psize, 8 * (free_ids + 1));
        self.reserve(6 * (free.depth as usize + 2) + record_pages + 16)?;
        let mut free = free;
        let saved = freelist::save(self, &mut free);
        self.store_record(FREE_DBI, free);
        saved?;

        let pages = self.flush_dirty()?;
        let end = PageId(self.top().next_pgno).offset(self.psize);
        if !self.env.writable_map() && self.env.io.len()? < end {
            self.env.io.set_len(end)?;
        }
        let synchronous = self.env.options.synchronous;
        if synchronous != Synchronous::Off {
            self.sync()?;
        }
        let meta = Meta {
            page_size: self.psize as u32,
            map_size: self.env.map_size(),
            free: self.record(FREE_DBI)?,
            main: self.record(MAIN_DBI)?,
            last_pgno: PageId(self.top().next_pgno - 1),
            txnid: TxnId(self.txnid),
        };
        let slot = Meta::slot_for(meta.txnid);
        let mut buf = vec![0u8; self.psize];
        encode_meta(&meta, slot, &mut buf);
        self.write_out(PageId(slot), &buf)?;
        if synchronous == Synchronous::Full {
            self.sync()?;
        }
        self.env.lock.set_txnid(self.txnid);
        let dropped = mem::take(&mut self.top_mut().dropped);
        self.env.withdraw(&dropped);
        self.env
            .set_main_flags(DbFlags::from_record(meta.main.flags));
        info!(
            txnid = self.txnid,
            pages,
            last_pgno = meta.last_pgno.0,
            "txn.commit"
        );
        Ok(())
    }

    /// Writes the dirty pages in page order, batching consecutive runs.
    fn flush_dirty(&mut self) -> Result<usize> {
        let top = self.top_mut();
        let mut pages: Vec<(PageId, Vec<u8>)> = top.dirty.drain().collect();
        top.dirty_pages = 0;
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);
        let count = pages.iter().map(|(_, b)| b.len() / self.psize).sum();
        let mut i = 0;
        while i < pages.len() {
            let start = pages[i].0;
            let mut end = start.0 + (pages[i].1.len() / self.psize) as u64;
            let mut j = i + 1;
            while j < pages.len() && pages[j].0 .0 == end {
                end += (pages[j].1.len() / self.psize) as u64;
                j += 1;
            }
            if self.env.writable_map() {
                for (pgno, buf) in &pages[i..j] {
                    self.map.write(pgno.offset(self.psize) as usize, buf)?;
                }
            } else {
                let slices: Vec<IoSlice<'_>> = pages[i..j].iter().map(|(_, b)| IoSlice::new(b)).collect();
                self.env.io.writev_at(start.offset(self.psize), &slices)?;
            }
            trace!(first = start.0, pages = end - start.0, "txn.flush_run");
            i = j;
        }
        Ok(count)
    }

    fn finish(&mut self, committed: bool) {
        if self.finished {
            return;
        }
        if !committed {
            let created: Vec<u32> = self.layers.iter().flat_map(|l| l.created.clone()).collect();
            self.env.withdraw(&created);
            debug!(txnid = self.txnid, "txn.abort");
        }
        self.layers.truncate(1);
        self.cursors.clear();
        self._guard = None;
        self.finished = true;
        self.env.txn_finished();
    }

    fn open_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.check()?;
        let main = self.record(MAIN_DBI)?;
        let main_flags = DbFlags::from_record(main.flags);
        let Some(name) = name else {
            let wanted = flags.persistent();
            if wanted.is_empty() || wanted == main_flags {
                return Ok(Database::MAIN);
            }
            if main.entries != 0 {
                return Err(KvError::Incompatible("database flags differ from the stored ones"));
            }
            let mut rec = main;
            rec.flags = wanted.bits() as u16;
            self.store_record(MAIN_DBI, rec);
            self.env.set_main_flags(wanted);
            return Ok(Database::MAIN);
        };
        if main_flags.contains(DbFlags::DUP_SORT) {
            return Err(KvError::Incompatible("main database is dup-sorted"));
        }
        let main_cfg = self.env.slot(MAIN_DBI)?.tree_cfg(main.flags);
        let existing = lookup_named(&*self, &main, &main_cfg, name)?;
        if existing.is_none() && !flags.contains(DbFlags::CREATE) {
            return Err(KvError::NotFound);
        }
        let stored = existing.map(|rec| DbFlags::from_record(rec.flags));
        let dbi = self.env.register_db(name, flags, stored)?;
        match existing {
            Some(rec) => {
                if !matches!(self.top().dbs.get(dbi as usize), Some(Some(_))) {
                    self.put_state(dbi, DbState { rec, changed: false });
                }
            }
            None => {
                let rec = DbRecord::empty(flags.to_record());
                self.store_record(dbi, rec);
                self.top_mut().created.push(dbi);
                debug!(name, dbi, "txn.db_created");
            }
        }
        Ok(Database(dbi))
    }

    fn empty_db(&mut self, dbi: u32, delete: bool) -> Result<()> {
        self.check()?;
        if dbi == FREE_DBI {
            return Err(KvError::Invalid("the free list cannot be emptied"));
        }
        let rec = self.record(dbi)?;
        if dbi == MAIN_DBI {
            if delete {
                return Err(KvError::Invalid("the main database cannot be dropped"));
            }
            if self.holds_named(&rec)? {
                return Err(KvError::Incompatible("main database holds named databases"));
            }
        }
        let res = self.release_db(dbi, rec, delete);
        if let Err(err) = &res {
            self.note_error(err);
        }
        res
    }

    fn holds_named(&self, main: &DbRecord) -> Result<bool> {
        let cfg = self.env.slot(MAIN_DBI)?.tree_cfg(main.flags);
        let mut st = CursorState::default();
        let mut item = btree::first(self, main, &cfg, &mut st)?.is_some();
        while item {
            if btree::current_flags(self, &st)?.contains(NodeFlags::SUBDATA) {
                return Ok(true);
            }
            item = btree::next_nodup(self, main, &cfg, &mut st)?.is_some();
        }
        Ok(false)
    }

    fn release_db(&mut self, dbi: u32, rec: DbRecord, delete: bool) -> Result<()> {
        btree::free_tree(self, &rec)?;
        self.reset_cursors(dbi);
        if !delete {
            let mut empty = DbRecord::empty(rec.flags);
            empty.pad = 0;
            self.store_record(dbi, empty);
            debug!(txnid = self.txnid, dbi, "txn.db_cleared");
            return Ok(());
        }
        let name = self.env.slot(dbi)?.name.ok_or(KvError::BadDbi)?;
        self.mutate_inner(MAIN_DBI, None, 0, |s, main, cfg, st| {
            if btree::set(&*s, main, cfg, st, name.as_bytes())?.is_none() {
                return Ok(());
            }
            btree::del(s, main, cfg, st, false)
        })?;
        let top = self.top_mut();
        if let Some(slot) = top.dbs.get_mut(dbi as usize) {
            *slot = None;
        }
        top.dropped.push(dbi);
        debug!(txnid = self.txnid, dbi, name, "txn.db_dropped");
        Ok(())
    }
}

impl PageSource for WriteState {
    fn page_size(&self) -> usize {
        self.psize
    }

    fn pages(&self, pgno: PageId, count: usize) -> Result<&[u8]> {
        let len = count * self.psize;
        for layer in self.layers.iter().rev() {
            if let Some(buf) = layer.dirty.get(&pgno) {
                return buf
                    .get(..len)
                    .ok_or(KvError::Corruption("page run shorter than requested"));
            }
        }
        if count == 0 || pgno.0 + count as u64 > self.top().next_pgno {
            return Err(KvError::Corruption("page beyond the end of the file"));
        }
        self.map.pages_at(pgno, count)
    }
}

impl PageStore for WriteState {
    fn page_mut(&mut self, pgno: PageId) -> Result<&mut [u8]> {
        self.top_mut()
            .dirty
            .get_mut(&pgno)
            .map(|buf| buf.as_mut_slice())
            .ok_or(KvError::Corruption("page is not dirty"))
    }

    fn is_dirty(&self, pgno: PageId) -> bool {
        self.top().dirty.contains_key(&pgno)
    }

    fn touch(&mut self, pgno: PageId) -> Result<PageId> {
        if self.is_dirty(pgno) {
            return Ok(pgno);
        }
        let buf = self.pages(pgno, 1)?.to_vec();
        if self.is_family(pgno) {
            self.top_mut().spilled.remove(&pgno);
            self.insert_dirty(pgno, buf)?;
            trace!(page = pgno.0, "txn.touch_family");
            return Ok(pgno);
        }
        let fresh = self.alloc(1)?;
        let mut buf = buf;
        page::set_pgno(&mut buf, fresh);
        if let Some(slot) = self.top_mut().dirty.get_mut(&fresh) {
            *slot = buf;
        }
        self.free(pgno, 1)?;
        trace!(old = pgno.0, new = fresh.0, "txn.touch");
        Ok(fresh)
    }

    fn alloc(&mut self, count: usize) -> Result<PageId> {
        let psize = self.psize;
        if count == 1 {
            if let Some(pgno) = self.top_mut().free.take_loose() {
                self.insert_dirty(pgno, vec![0; psize])?;
                return Ok(pgno);
            }
        }
        loop {
            if let Some(pgno) = self.top_mut().free.take_run(count) {
                self.insert_dirty(pgno, vec![0; psize * count])?;
                trace!(page = pgno.0, count, "txn.alloc_reused");
                return Ok(pgno);
            }
            if self.top().free.saving {
                break;
            }
            let after = self.top().free.reclaim.as_ref().map(|r| r.last_reclaimed);
            let free = self.record(FREE_DBI)?;
            match reclaim_next(&*self, &free, after, self.oldest)? {
                Some((key, ids)) => {
                    self.top_mut().free.absorb(key, &ids);
                    self.env.stats.record_reclaim();
                    debug!(txnid = self.txnid, record = key, pages = ids.len(), "freelist.reclaim");
                }
                None => break,
            }
        }
        let pgno = self.top().next_pgno;
        if pgno + count as u64 > self.max_pgno {
            return Err(KvError::MapFull);
        }
        self.insert_dirty(PageId(pgno), vec![0; psize * count])?;
        self.top_mut().next_pgno += count as u64;
        Ok(PageId(pgno))
    }

    fn free(&mut self, pgno: PageId, count: usize) -> Result<()> {
        let family = self.is_family(pgno);
        let psize = self.psize;
        let top = self.top_mut();
        if family {
            if let Some(buf) = top.dirty.remove(&pgno) {
                top.dirty_pages -= buf.len() / psize;
            }
            top.spilled.remove(&pgno);
            top.discarded.push(pgno);
            top.free.release_born(pgno, count);
        } else {
            top.free.release_old(pgno, count);
        }
        trace!(page = pgno.0, count, family, "txn.free");
        Ok(())
    }

    fn stats(&self) -> &BTreeStats {
        &self.env.stats
    }
}

impl FreeListStore for WriteState {
    fn free_state(&mut self) -> &mut FreeState {
        &mut self.top_mut().free
    }

    fn txnid(&self) -> u64 {
        self.txnid
    }
}

/// The write transaction. Only one exists per environment at a time,
/// across every process sharing the files.
///
/// Methods take `&self` so cursors and direct puts can be mixed; items are
/// returned as owned buffers because pages may move under later writes.
pub struct RwTxn {
    pub(crate) state: RefCell<WriteState>,
}

impl RwTxn {
    pub(crate) fn begin(env: Arc<EnvInner>) -> Result<Self> {
        env.check_usable()?;
        if env.options.read_only {
            return Err(KvError::Invalid("environment is read-only"));
        }
        let guard = env.lock.lock_writer()?;
        let meta = env.latest_meta()?;
        let map = env.map_covering(meta.last_pgno.0 + 1, meta.map_size)?;
        let txnid = meta.txnid.0 + 1;
        let oldest = env.readers.oldest(txnid);
        let psize = env.page_size;
        let layer = Layer {
            dbs: vec![
                Some(DbState {
                    rec: meta.free,
                    changed: false,
                }),
                Some(DbState {
                    rec: meta.main,
                    changed: false,
                }),
            ],
            next_pgno: meta.last_pgno.0 + 1,
            ..Layer::default()
        };
        env.set_main_flags(DbFlags::from_record(meta.main.flags));
        env.txn_started();
        debug!(txnid, oldest, last_pgno = meta.last_pgno.0, "txn.begin_rw");
        Ok(Self {
            state: RefCell::new(WriteState {
                max_pgno: map.pages(),
                env,
                map,
                psize,
                txnid,
                oldest,
                layers: vec![layer],
                cursors: Vec::new(),
                _guard: Some(guard),
                finished: false,
            }),
        })
    }

    /// Id this transaction commits as.
    pub fn id(&self) -> u64 {
        self.state.borrow().txnid
    }

    /// Page size of the environment.
    pub fn page_size(&self) -> usize {
        self.state.borrow().psize
    }

    /// Opens or, with [`DbFlags::CREATE`], creates a named database. `None`
    /// names the main database; its flags may only change while it is
    /// empty. Handles of databases created here are withdrawn if the
    /// transaction aborts.
    pub fn open_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.state.borrow_mut().open_db(name, flags)
    }

    /// Value stored under `key`; the first value for dup-sort databases.
    pub fn get(&self, db: Database, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.borrow_mut();
        state.check()?;
        let rec = state.record(db.0)?;
        let cfg = state.cfg(db.0, &rec)?;
        let mut st = CursorState::default();
        Ok(btree::set(&*state, &rec, &cfg, &mut st, key)?.map(|(_, v)| v.to_vec()))
    }

    /// Stores `data` under `key`.
    pub fn put(&self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        if flags.intersects(WriteFlags::CURRENT | WriteFlags::RESERVE) {
            return Err(KvError::Invalid("CURRENT and RESERVE need a cursor or put_reserve"));
        }
        self.put_inner(db, key, data, flags)
    }

    /// Reserves `len` bytes under `key` and lets `fill` write them before
    /// the item is stored.
    pub fn put_reserve(
        &self,
        db: Database,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
        fill: impl FnOnce(&mut [u8]),
    ) -> Result<()> {
        if flags.contains(WriteFlags::CURRENT) {
            return Err(KvError::Invalid("CURRENT needs a cursor"));
        }
        let flags_db = self.db_flags(db)?;
        if flags_db.contains(DbFlags::DUP_SORT) {
            return Err(KvError::Incompatible("reserve is not supported on dup-sorted databases"));
        }
        let mut buf = vec![0u8; len];
        fill(&mut buf);
        self.put_inner(db, key, &buf, flags - WriteFlags::RESERVE)
    }

    fn put_inner(&self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let db_flags = self.db_flags(db)?;
        if !db_flags.contains(DbFlags::DUP_SORT)
            && flags.intersects(WriteFlags::NO_DUP_DATA | WriteFlags::APPEND_DUP)
        {
            return Err(KvError::Incompatible("flag needs a dup-sorted database"));
        }
        check_sizes(db_flags, key, data)?;
        let mode = put_mode(flags);
        let extra = page::overflow_count(self.page_size(), data.len());
        self.state
            .borrow_mut()
            .mutate(db.0, None, extra, |s, rec, cfg, st| btree::put(s, rec, cfg, st, key, data, mode))
    }

    /// Deletes `key`. With `data` on a dup-sort database only that value is
    /// removed; without it every value of the key goes.
    pub fn del(&self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        self.state.borrow_mut().mutate(db.0, None, 0, |s, rec, cfg, st| {
            let found = match (data, cfg.dup) {
                (Some(value), Some(_)) => btree::get_both(&*s, rec, cfg, st, key, value)?.is_some(),
                _ => btree::set(&*s, rec, cfg, st, key)?.is_some(),
            };
            if !found {
                return Err(KvError::NotFound);
            }
            if db.0 == MAIN_DBI && btree::current_flags(&*s, st)?.contains(NodeFlags::SUBDATA) {
                return Err(KvError::Incompatible("key names a database; drop it instead"));
            }
            let all = data.is_none() && cfg.dup.is_some();
            btree::del(s, rec, cfg, st, all)
        })
    }

    /// Opens a cursor over `db`.
    pub fn cursor(&self, db: Database) -> Result<RwCursor<'_>> {
        let slot = self.state.borrow_mut().open_cursor(db.0)?;
        Ok(RwCursor::new(self, slot))
    }

    /// Removes every item of `db`, keeping the database.
    pub fn clear_db(&self, db: Database) -> Result<()> {
        self.state.borrow_mut().empty_db(db.0, false)
    }

    /// Removes `db` and its record. The handle becomes invalid once the
    /// transaction commits.
    pub fn drop_db(&self, db: Database) -> Result<()> {
        self.state.borrow_mut().empty_db(db.0, true)
    }

    /// Statistics of `db` as seen by this transaction.
    pub fn stat(&self, db: Database) -> Result<Stat> {
        let mut state = self.state.borrow_mut();
        let rec = state.record(db.0)?;
        Ok(Stat::of(&rec, state.psize))
    }

    /// Persistent flags of `db`.
    pub fn db_flags(&self, db: Database) -> Result<DbFlags> {
        let mut state = self.state.borrow_mut();
        state.check()?;
        Ok(DbFlags::from_record(state.record(db.0)?.flags))
    }

    /// Starts a child transaction. Its changes become part of this one
    /// when it commits and vanish when it aborts.
    pub fn nested(&mut self) -> Result<NestedTxn<'_>> {
        self.state.get_mut().begin_nested()?;
        Ok(NestedTxn {
            parent: self,
            done: false,
        })
    }

    /// Makes every change durable (per the environment's `synchronous`
    /// setting) and visible to new readers.
    pub fn commit(mut self) -> Result<()> {
        let state = self.state.get_mut();
        let res = state.commit_top();
        state.finish(res.is_ok());
        res
    }

    /// Discards every change. Equivalent to dropping the transaction.
    pub fn abort(self) {}
}

impl Drop for RwTxn {
    fn drop(&mut self) {
        self.state.get_mut().finish(false);
    }
}

/// A child of a [`RwTxn`]. Dereferences to the parent's API, so every
/// read and write goes through the child until it ends.
pub struct NestedTxn<'p> {
    parent: &'p mut RwTxn,
    done: bool,
}

impl NestedTxn<'_> {
    /// Folds the child's changes into the parent.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.parent.state.get_mut().commit_nested()
    }

    /// Discards the child's changes. Equivalent to dropping it.
    pub fn abort(self) {}
}

impl Deref for NestedTxn<'_> {
    type Target = RwTxn;

    fn deref(&self) -> &RwTxn {
        self.parent
    }
}

impl DerefMut for NestedTxn<'_> {
    fn deref_mut(&mut self) -> &mut RwTxn {
        self.parent
    }
}

impl Drop for NestedTxn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.parent.state.get_mut().abort_nested();
        }
    }
}
