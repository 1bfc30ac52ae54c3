//! Snapshot registry shared by every process using an environment.
//!
//! Each read transaction claims a slot in the lock file's reader table and
//! publishes the txnid of the snapshot it reads. Writers take the minimum of
//! those ids to decide which FREE records may be reused.

use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;

use rustc_hash::FxHasher;
use serde::Serialize;
use tracing::{trace, warn};

use crate::primitives::concurrency::{process_alive, LockFile};
use crate::types::{KvError, Result};

/// One row of [`ReaderRegistry::list`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReaderInfo {
    /// Slot index.
    pub slot: u32,
    /// Owning process.
    pub pid: u32,
    /// Hash of the owning thread id.
    pub tid: u64,
    /// Pinned snapshot, `None` while the slot is claimed but idle.
    pub txnid: Option<u64>,
}

/// Reader table view over a lock file.
#[derive(Clone)]
pub struct ReaderRegistry {
    lock: LockFile,
    pid: u32,
}

/// A claimed reader slot. Dropping it frees the slot.
pub struct ReaderSlot {
    lock: LockFile,
    idx: u32,
}

fn thread_tag() -> u64 {
    let mut hasher = FxHasher::default();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

impl ReaderRegistry {
    /// Wraps the reader table of `lock`.
    pub fn new(lock: LockFile) -> Self {
        Self {
            lock,
            pid: std::process::id(),
        }
    }

    /// Underlying lock file.
    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    /// Claims a free slot, growing the used part of the table if needed.
    pub fn acquire(&self) -> Result<ReaderSlot> {
        let pid = self.pid;
        let idx = self.lock.with_table(|lock| {
            let used = lock.num_readers();
            let free = (0..used).find(|&i| lock.slot(i).pid.load(Ordering::Acquire) == 0);
            let idx = match free {
                Some(idx) => idx,
                None if used < lock.max_readers() => {
                    lock.set_num_readers(used + 1);
                    used
                }
                None => return None,
            };
            let slot = lock.slot(idx);
            slot.txnid.store(u64::MAX, Ordering::Release);
            slot.tid.store(thread_tag(), Ordering::Release);
            slot.pid.store(pid, Ordering::Release);
            Some(idx)
        })?;
        let idx = idx.ok_or(KvError::ReadersFull)?;
        trace!(slot = idx, "mvcc.reader_acquire");
        Ok(ReaderSlot {
            lock: self.lock.clone(),
            idx,
        })
    }

    /// Oldest snapshot any reader or the previous commit can still use.
    pub fn oldest(&self, writer_txnid: u64) -> u64 {
        let mut oldest = writer_txnid.saturating_sub(1);
        for i in 0..self.lock.num_readers() {
            let slot = self.lock.slot(i);
            if slot.pid.load(Ordering::Acquire) == 0 {
                continue;
            }
            oldest = oldest.min(slot.txnid.load(Ordering::Acquire));
        }
        oldest
    }

    /// Snapshot of every claimed slot.
    pub fn list(&self) -> Vec<ReaderInfo> {
        (0..self.lock.num_readers())
            .filter_map(|i| {
                let slot = self.lock.slot(i);
                let pid = slot.pid.load(Ordering::Acquire);
                if pid == 0 {
                    return None;
                }
                let txnid = slot.txnid.load(Ordering::Acquire);
                Some(ReaderInfo {
                    slot: i,
                    pid,
                    tid: slot.tid.load(Ordering::Acquire),
                    txnid: (txnid != u64::MAX).then_some(txnid),
                })
            })
            .collect()
    }

    /// Frees slots owned by processes that no longer exist. Returns how many
    /// were cleared.
    pub fn check(&self) -> Result<usize> {
        let mine = self.pid;
        self.lock.with_table(|lock| {
            let mut cleared = 0;
            for i in 0..lock.num_readers() {
                let slot = lock.slot(i);
                let pid = slot.pid.load(Ordering::Acquire);
                if pid == 0 || pid == mine || process_alive(pid) {
                    continue;
                }
                warn!(slot = i, pid, txnid = slot.txnid.load(Ordering::Acquire), "mvcc.stale_reader");
                slot.txnid.store(u64::MAX, Ordering::Release);
                slot.pid.store(0, Ordering::Release);
                cleared += 1;
            }
            cleared
        })
    }
}

impl ReaderSlot {
    /// Publishes the latest committed txnid in this slot and returns it.
    /// The store is re-checked so a concurrent commit cannot slip between
    /// reading the id and publishing it.
    pub fn pin(&self) -> u64 {
        let slot = self.lock.slot(self.idx);
        loop {
            let txnid = self.lock.txnid();
            slot.txnid.store(txnid, Ordering::SeqCst);
            if self.lock.txnid() == txnid {
                return txnid;
            }
        }
    }

    /// Slot index in the table.
    pub fn index(&self) -> u32 {
        self.idx
    }
}

impl Drop for ReaderSlot {
    fn drop(&mut self) {
        let slot = self.lock.slot(self.idx);
        slot.txnid.store(u64::MAX, Ordering::Release);
        slot.pid.store(0, Ordering::Release);
        trace!(slot = self.idx, "mvcc.reader_release");
    }
}
