//! Page reuse bookkeeping for a write transaction.
//!
//! Pages a transaction stops referencing are recorded in the FREE database
//! under that transaction's id once it commits. A later writer may pull a
//! record back (`reclaim`) when no reader can still see a snapshot older
//! than the record's id. Pages born and freed inside one transaction family
//! never reach the FREE database: they are "loose" and reused immediately.
#![forbid(unsafe_code)]

use tracing::{debug, trace};

use crate::storage::btree::{self, cmp_int, CursorState, DbRecord, PageSource, PageStore, PutMode, TreeCfg};
use crate::types::{KvError, PageId, Result};

/// Rounds the save loop may take before giving up.
const MAX_SAVE_ROUNDS: usize = 64;

/// Pages pulled out of the FREE database for reuse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reclaim {
    /// Reusable page numbers, ascending.
    pub pghead: Vec<PageId>,
    /// Highest FREE key consumed so far.
    pub last_reclaimed: u64,
}

/// Free-page state of one transaction layer.
#[derive(Clone, Debug, Default)]
pub struct FreeState {
    /// Committed pages released by this transaction, recorded at commit.
    pub free_pgs: Vec<PageId>,
    /// Pages born and released in this transaction family.
    pub loose: Vec<PageId>,
    /// Reclaimed FREE records, if any were read.
    pub reclaim: Option<Reclaim>,
    /// Set while the FREE database itself is being rewritten.
    pub saving: bool,
}

impl FreeState {
    /// Pops a loose page.
    pub fn take_loose(&mut self) -> Option<PageId> {
        self.loose.pop()
    }

    /// Removes the lowest run of `count` consecutive pages from `pghead`.
    pub fn take_run(&mut self, count: usize) -> Option<PageId> {
        let head = &mut self.reclaim.as_mut()?.pghead;
        if count == 0 || head.len() < count {
            return None;
        }
        let start = (0..=head.len() - count).find(|&i| head[i + count - 1].0 - head[i].0 == count as u64 - 1)?;
        let first = head[start];
        head.drain(start..start + count);
        Some(first)
    }

    /// Merges the ids of FREE record `key` into `pghead`.
    pub fn absorb(&mut self, key: u64, ids: &[PageId]) {
        let reclaim = self.reclaim.get_or_insert_with(Reclaim::default);
        reclaim.pghead.extend_from_slice(ids);
        reclaim.pghead.sort_unstable();
        reclaim.pghead.dedup();
        reclaim.last_reclaimed = reclaim.last_reclaimed.max(key);
    }

    /// Releases pages allocated by this transaction family.
    pub fn release_born(&mut self, pgno: PageId, count: usize) {
        if count == 1 {
            self.loose.push(pgno);
            return;
        }
        let run = (0..count as u64).map(|i| PageId(pgno.0 + i));
        match self.reclaim.as_mut() {
            Some(reclaim) => {
                reclaim.pghead.extend(run);
                reclaim.pghead.sort_unstable();
            }
            None => self.free_pgs.extend(run),
        }
    }

    /// Releases pages that belong to a committed snapshot.
    pub fn release_old(&mut self, pgno: PageId, count: usize) {
        self.free_pgs
            .extend((0..count as u64).map(|i| PageId(pgno.0 + i)));
    }

    fn fold_loose(&mut self) -> bool {
        if self.loose.is_empty() {
            return false;
        }
        self.free_pgs.append(&mut self.loose);
        true
    }
}

/// Page store that also owns the free-page state of the running transaction.
pub trait FreeListStore: PageStore {
    /// Free-page state of the innermost transaction.
    fn free_state(&mut self) -> &mut FreeState;

    /// Id the running transaction will commit as.
    fn txnid(&self) -> u64;
}

/// Encodes a FREE record value: a count followed by the ids, all native
/// endian, zero-padded to `reserve` ids.
pub fn encode_ids(ids: &[PageId], reserve: usize) -> Vec<u8> {
    let slots = reserve.max(ids.len());
    let mut out = Vec::with_capacity(8 * (slots + 1));
    out.extend_from_slice(&(ids.len() as u64).to_ne_bytes());
    for id in ids {
        out.extend_from_slice(&id.0.to_ne_bytes());
    }
    out.resize(8 * (slots + 1), 0);
    out
}

fn ne_u64(b: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| KvError::Corruption("free-list word truncated"))?;
    Ok(u64::from_ne_bytes(arr))
}

/// Decodes a FREE record value written by [`encode_ids`].
pub fn decode_ids(buf: &[u8]) -> Result<Vec<PageId>> {
    if buf.len() < 8 || buf.len() % 8 != 0 {
        return Err(KvError::Corruption("free-list record has bad length"));
    }
    let count = ne_u64(&buf[..8])? as usize;
    if count > buf.len() / 8 - 1 {
        return Err(KvError::Corruption("free-list record count exceeds its length"));
    }
    buf[8..8 + count * 8]
        .chunks_exact(8)
        .map(|w| ne_u64(w).map(PageId))
        .collect()
}

/// Key of a FREE record.
pub fn free_key(txnid: u64) -> [u8; 8] {
    txnid.to_ne_bytes()
}

fn free_cfg() -> TreeCfg {
    TreeCfg::plain(cmp_int)
}

/// Finds the first FREE record after `after` whose id is below `oldest`.
pub fn reclaim_next<S: PageSource + ?Sized>(
    src: &S,
    free_db: &DbRecord,
    after: Option<u64>,
    oldest: u64,
) -> Result<Option<(u64, Vec<PageId>)>> {
    let cfg = free_cfg();
    let mut st = CursorState::default();
    let item = match after {
        None => btree::first(src, free_db, &cfg, &mut st)?,
        Some(after) => match after.checked_add(1) {
            Some(from) => btree::set_range(src, free_db, &cfg, &mut st, &free_key(from))?,
            None => None,
        },
    };
    let Some((key, value)) = item else {
        return Ok(None);
    };
    let key = ne_u64(key)?;
    if key >= oldest {
        return Ok(None);
    }
    Ok(Some((key, decode_ids(value)?)))
}

/// Rewrites the FREE database so it records every page released by the
/// running transaction and every reclaimed page still unused.
///
/// Writing the FREE database can itself allocate and release pages, so the
/// records are rewritten until a round changes nothing. Record sizes only
/// grow across rounds, which lets later rounds overwrite in place.
pub fn save<S: FreeListStore + ?Sized>(store: &mut S, free_db: &mut DbRecord) -> Result<()> {
    let cfg = free_cfg();
    let txnid = store.txnid();
    store.free_state().saving = true;

    if let Some(last) = store.free_state().reclaim.as_ref().map(|r| r.last_reclaimed) {
        loop {
            let mut st = CursorState::default();
            let key = match btree::first(&*store, free_db, &cfg, &mut st)? {
                Some((k, _)) => ne_u64(k)?,
                None => break,
            };
            if key > last {
                break;
            }
            btree::del(store, free_db, &cfg, &mut st, false)?;
        }
    }

    let mut reserve_free = 0usize;
    let mut reserve_head = 0usize;
    for round in 0..MAX_SAVE_ROUNDS {
        let (free_pgs, head) = {
            let state = store.free_state();
            state.fold_loose();
            state.free_pgs.sort_unstable();
            state.free_pgs.dedup();
            (
                state.free_pgs.clone(),
                state.reclaim.as_ref().map(|r| (r.last_reclaimed, r.pghead.clone())),
            )
        };

        if !free_pgs.is_empty() {
            reserve_free = reserve_free.max(free_pgs.len());
            let value = encode_ids(&free_pgs, reserve_free);
            let mut st = CursorState::default();
            btree::put(store, free_db, &cfg, &mut st, &free_key(txnid), &value, PutMode::default())?;
        }
        if let Some((last, pghead)) = &head {
            let mut st = CursorState::default();
            if pghead.is_empty() {
                if btree::set(&*store, free_db, &cfg, &mut st, &free_key(*last))?.is_some() {
                    btree::del(store, free_db, &cfg, &mut st, false)?;
                }
            } else {
                reserve_head = reserve_head.max(pghead.len());
                let value = encode_ids(pghead, reserve_head);
                btree::put(store, free_db, &cfg, &mut st, &free_key(*last), &value, PutMode::default())?;
            }
        }

        let state = store.free_state();
        let grew = state.fold_loose();
        state.free_pgs.sort_unstable();
        state.free_pgs.dedup();
        let head_now = state.reclaim.as_ref().map(|r| (r.last_reclaimed, r.pghead.clone()));
        if !grew && state.free_pgs == free_pgs && head_now == head {
            state.saving = false;
            debug!(txnid, freed = free_pgs.len(), rounds = round + 1, "freelist.save");
            return Ok(());
        }
        trace!(txnid, round, freed = state.free_pgs.len(), "freelist.save_round");
    }
    Err(KvError::Corruption("free list save did not converge"))
}
