//! Hot backup of an environment while readers and a writer keep running.

use std::fs::{self, OpenOptions};
use std::path::Path;

use tracing::{debug, info, warn};

use super::config::{DbFlags, EnvOptions, Synchronous, WriteFlags};
use super::env::{Database, DbSlot, Environment};
use super::txn::{RoTxn, RwTxn};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::pager::page::NodeFlags;
use crate::primitives::pager::{encode_meta, DbRecord};
use crate::storage::btree::TreeCfg;
use crate::types::{KvError, PageId, Result};

/// Pages copied per write when streaming a snapshot.
const COPY_CHUNK_PAGES: u64 = 256;

impl Environment {
    /// Writes a consistent copy of the latest commit to `path`.
    ///
    /// The copy is taken from a read snapshot, so writers are not blocked.
    /// With `compact` the trees are rebuilt item by item into a fresh file,
    /// leaving out free pages; otherwise pages are copied as they are. `path`
    /// follows the same layout rule as [`Environment::open`], and the
    /// destination data file must not exist yet.
    pub fn copy(&self, path: impl AsRef<Path>, compact: bool) -> Result<()> {
        let path = path.as_ref();
        let target = if self.inner.options.no_sub_dir {
            path.to_path_buf()
        } else {
            fs::create_dir_all(path)?;
            path.join("data.mdb")
        };
        if target.exists() {
            return Err(KvError::Invalid("copy destination already exists"));
        }
        let txn = self.begin_ro()?;
        if compact {
            self.copy_compact(&txn, path, &target)
        } else {
            copy_pages(&txn, &target, self.page_size())
        }
    }

    fn copy_compact(&self, src: &RoTxn, path: &Path, target: &Path) -> Result<()> {
        let names = named_databases(src)?;
        let options = EnvOptions {
            map_size: self.inner.map_size(),
            page_size: self.page_size() as u32,
            max_dbs: names.len() as u32,
            max_readers: 4,
            synchronous: Synchronous::Full,
            no_sub_dir: self.inner.options.no_sub_dir,
            ..EnvOptions::default()
        };
        let dest = Environment::open(path, options)?;
        let lock_path = dest.lock_path().to_path_buf();
        let res = fill_compact(self, src, &dest, &names);
        drop(dest);
        if let Err(err) = fs::remove_file(&lock_path) {
            warn!(path = %lock_path.display(), error = %err, "env.copy_lock_cleanup_failed");
        }
        if res.is_err() {
            if let Err(err) = fs::remove_file(target) {
                warn!(path = %target.display(), error = %err, "env.copy_partial_cleanup_failed");
            }
        }
        res?;
        info!(target = %target.display(), databases = names.len(), "env.copy_compact");
        Ok(())
    }
}

fn copy_pages(txn: &RoTxn, target: &Path, psize: usize) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)?;
    let io = StdFileIo::new(file);
    let meta = *txn.meta();
    let mut head = vec![0u8; psize * 2];
    encode_meta(&meta, 0, &mut head[..psize]);
    encode_meta(&meta, 1, &mut head[psize..]);
    io.write_at(0, &head)?;
    let last = meta.last_pgno.0;
    let mut pgno = 2;
    while pgno <= last {
        let count = COPY_CHUNK_PAGES.min(last + 1 - pgno);
        let pages = txn.map().pages_at(PageId(pgno), count as usize)?;
        io.write_at(PageId(pgno).offset(psize), pages)?;
        pgno += count;
    }
    io.sync_all()?;
    info!(target = %target.display(), txnid = meta.txnid.0, pages = last + 1, "env.copy");
    Ok(())
}

/// Names of every named database in the snapshot.
fn named_databases(txn: &RoTxn) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut cur = txn.cursor(Database::MAIN)?;
    let mut item = cur.first()?;
    while let Some((key, _)) = item {
        if cur.node_flags()?.contains(NodeFlags::SUBDATA) {
            let name = std::str::from_utf8(key)
                .map_err(|_| KvError::Invalid("database name is not UTF-8"))?;
            names.push(name.to_owned());
        }
        item = cur.next_nodup()?;
    }
    Ok(names)
}

fn fill_compact(
    env: &Environment,
    src: &RoTxn,
    dest: &Environment,
    names: &[String],
) -> Result<()> {
    let dst = dest.begin_rw()?;
    let main_flags = src.db_flags(Database::MAIN)?;
    let main = dst.open_db(None, main_flags)?;
    let main_slot = env.inner.slot(Database::MAIN.0)?;
    dest.set_comparators(main, main_slot.cmp, main_slot.dcmp)?;
    let (rec, cfg) = src.db(Database::MAIN)?;
    copy_tree(src, rec, cfg, &dst, main, main_flags, true)?;

    for name in names {
        let rec = src
            .named_record(name)?
            .ok_or(KvError::Corruption("named database vanished from its snapshot"))?;
        let flags = DbFlags::from_record(rec.flags);
        let slot = env.inner.slot_by_name(name).unwrap_or(DbSlot {
            name: Some(name.clone()),
            flags,
            cmp: None,
            dcmp: None,
            valid: true,
        });
        let db = dst.open_db(Some(name), flags | DbFlags::CREATE)?;
        dest.set_comparators(db, slot.cmp, slot.dcmp)?;
        let cfg = slot.tree_cfg(rec.flags);
        copy_tree(src, rec, cfg, &dst, db, flags, false)?;
        debug!(name, entries = rec.entries, "env.copy_db");
    }
    dst.commit()
}

fn copy_tree(
    src: &RoTxn,
    rec: DbRecord,
    cfg: TreeCfg,
    dst: &RwTxn,
    db: Database,
    flags: DbFlags,
    skip_records: bool,
) -> Result<()> {
    let mut put_flags = WriteFlags::APPEND;
    if flags.contains(DbFlags::DUP_SORT) {
        put_flags |= WriteFlags::APPEND_DUP;
    }
    let mut cur = src.raw_cursor(rec, cfg);
    let mut item = cur.first()?;
    while let Some((key, value)) = item {
        if !(skip_records && cur.node_flags()?.contains(NodeFlags::SUBDATA)) {
            dst.put(db, key, value, put_flags)?;
        }
        item = cur.next()?;
    }
    Ok(())
}
