use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::{DbFlags, EnvOptions};
use super::txn::{RoTxn, RwTxn, Stat};
use crate::primitives::concurrency::LockFile;
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::primitives::map::Map;
use crate::primitives::pager::{decode_meta, encode_meta, load_meta, Meta};
use crate::storage::btree::{
    self, cmp_int, cmp_lex, cmp_reverse, BTreeStats, BTreeStatsSnapshot, CompareFn, DupCfg, TreeCfg,
};
use crate::storage::mvcc::{ReaderInfo, ReaderRegistry};
use crate::types::{KvError, PageId, Result, TxnId, CORE_DBS, FREE_DBI, MAIN_DBI};

/// Data files opened by this process. LMDB-style locks are per process, so
/// a second handle on the same file would bypass them.
static OPEN_FILES: Mutex<Vec<PathBuf>> = const_mutex(Vec::new());

/// Handle to one database inside an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Database(pub(crate) u32);

impl Database {
    /// The unnamed main database.
    pub const MAIN: Database = Database(MAIN_DBI);

    /// Slot index of the handle.
    pub fn dbi(self) -> u32 {
        self.0
    }
}

/// Environment-wide figures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EnvInfo {
    /// Bytes mapped.
    pub map_size: u64,
    /// Page size of the data file.
    pub page_size: u32,
    /// Highest page in use by the latest commit.
    pub last_pgno: u64,
    /// Latest committed transaction.
    pub last_txnid: u64,
    /// Reader table capacity.
    pub max_readers: u32,
    /// Reader slots currently in use.
    pub num_readers: u32,
}

/// Process-local settings of one database slot.
#[derive(Clone)]
pub(crate) struct DbSlot {
    pub(crate) name: Option<String>,
    pub(crate) flags: DbFlags,
    pub(crate) cmp: Option<CompareFn>,
    pub(crate) dcmp: Option<CompareFn>,
    pub(crate) valid: bool,
}

impl DbSlot {
    fn core(flags: DbFlags) -> Self {
        Self {
            name: None,
            flags,
            cmp: None,
            dcmp: None,
            valid: true,
        }
    }

    /// Tree shape for a database whose record carries `rec_flags`.
    pub(crate) fn tree_cfg(&self, rec_flags: u16) -> TreeCfg {
        let flags = DbFlags::from_record(rec_flags);
        let cmp = self.cmp.unwrap_or(if flags.contains(DbFlags::INTEGER_KEY) {
            cmp_int
        } else if flags.contains(DbFlags::REVERSE_KEY) {
            cmp_reverse
        } else {
            cmp_lex
        });
        let dup = flags.contains(DbFlags::DUP_SORT).then(|| DupCfg {
            cmp: self.dcmp.unwrap_or(if flags.contains(DbFlags::INTEGER_DUP) {
                cmp_int
            } else if flags.contains(DbFlags::REVERSE_DUP) {
                cmp_reverse
            } else {
                cmp_lex
            }),
            fixed: flags.contains(DbFlags::DUP_FIXED),
        });
        TreeCfg {
            cmp,
            leaf2: None,
            dup,
        }
    }
}

struct Registration(PathBuf);

impl Registration {
    fn claim(path: PathBuf) -> Result<Self> {
        let mut open = OPEN_FILES.lock();
        if open.contains(&path) {
            return Err(KvError::Invalid("environment already open in this process"));
        }
        open.push(path.clone());
        Ok(Self(path))
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        OPEN_FILES.lock().retain(|p| p != &self.0);
    }
}

pub(crate) struct EnvInner {
    pub(crate) path: PathBuf,
    pub(crate) data_path: PathBuf,
    pub(crate) lock_path: PathBuf,
    pub(crate) options: EnvOptions,
    pub(crate) page_size: usize,
    pub(crate) io: StdFileIo,
    pub(crate) lock: LockFile,
    pub(crate) readers: ReaderRegistry,
    pub(crate) stats: BTreeStats,
    map: RwLock<Arc<Map>>,
    map_size: AtomicU64,
    dbis: RwLock<Vec<DbSlot>>,
    fatal: AtomicBool,
    active: AtomicUsize,
    _registration: Registration,
}

impl EnvInner {
    /// Fails once the environment has seen a fatal error.
    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(KvError::Panic);
        }
        Ok(())
    }

    /// Records `err` against the environment if it is fatal.
    pub(crate) fn note_error(&self, err: &KvError) {
        if err.is_fatal() && !self.fatal.swap(true, Ordering::AcqRel) {
            warn!(error = %err, path = %self.path.display(), "env.fatal");
        }
    }

    pub(crate) fn txn_started(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn txn_finished(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn map_size(&self) -> u64 {
        self.map_size.load(Ordering::Acquire)
    }

    pub(crate) fn writable_map(&self) -> bool {
        self.options.write_map && !self.options.read_only
    }

    /// Current map, remapped first if it does not cover `pages` pages or
    /// `map_size` bytes.
    pub(crate) fn map_covering(&self, pages: u64, map_size: u64) -> Result<Arc<Map>> {
        let psize = self.page_size as u64;
        {
            let map = self.map.read();
            if map.pages() >= pages && map.len() as u64 >= map_size {
                return Ok(Arc::clone(&map));
            }
        }
        let mut guard = self.map.write();
        if guard.pages() >= pages && guard.len() as u64 >= map_size {
            return Ok(Arc::clone(&guard));
        }
        let len = round_up(map_size.max(pages * psize).max(guard.len() as u64), psize);
        self.remap(&mut guard, len)?;
        Ok(Arc::clone(&guard))
    }

    fn remap(&self, slot: &mut Arc<Map>, len: u64) -> Result<()> {
        if self.writable_map() && self.io.len()? < len {
            self.io.set_len(len)?;
        }
        let map = Map::open(self.io.file(), len as usize, self.page_size, self.writable_map())?;
        *slot = Arc::new(map);
        self.map_size.fetch_max(len, Ordering::AcqRel);
        debug!(len, "env.remap");
        Ok(())
    }

    /// Reads the meta page of the latest commit straight from the file.
    pub(crate) fn latest_meta(&self) -> Result<Meta> {
        let txnid = TxnId(self.lock.txnid());
        let slot = Meta::slot_for(txnid);
        let mut buf = vec![0u8; self.page_size];
        self.io.read_at(PageId(slot).offset(self.page_size), &mut buf)?;
        let meta = decode_meta(&buf, slot)?;
        if meta.txnid != txnid {
            return Err(KvError::Corruption("meta page does not match the committed txnid"));
        }
        Ok(meta)
    }

    pub(crate) fn slot(&self, dbi: u32) -> Result<DbSlot> {
        match self.dbis.read().get(dbi as usize) {
            Some(slot) if slot.valid => Ok(slot.clone()),
            _ => Err(KvError::BadDbi),
        }
    }

    /// Returns the slot for `name`, claiming one if this process has not
    /// opened it yet. `stored` holds the flags on disk when the database
    /// exists.
    pub(crate) fn register_db(&self, name: &str, flags: DbFlags, stored: Option<DbFlags>) -> Result<u32> {
        let wanted = flags.persistent();
        let effective = match stored {
            Some(stored) if !wanted.is_empty() && stored != wanted => {
                return Err(KvError::Incompatible("database flags differ from the stored ones"));
            }
            Some(stored) => stored,
            None => wanted,
        };
        let mut dbis = self.dbis.write();
        if let Some(idx) = dbis
            .iter()
            .position(|s| s.valid && s.name.as_deref() == Some(name))
        {
            dbis[idx].flags = effective;
            return Ok(idx as u32);
        }
        let named = dbis.iter().skip(CORE_DBS as usize).filter(|s| s.valid).count();
        if named >= self.options.max_dbs as usize {
            return Err(KvError::DbsFull);
        }
        dbis.push(DbSlot {
            name: Some(name.to_owned()),
            flags: effective,
            cmp: None,
            dcmp: None,
            valid: true,
        });
        debug!(name, dbi = dbis.len() - 1, "env.db_registered");
        Ok(dbis.len() as u32 - 1)
    }

    /// Withdraws handles of databases created by an aborted transaction or
    /// dropped by a committed one.
    pub(crate) fn withdraw(&self, dbis: &[u32]) {
        if dbis.is_empty() {
            return;
        }
        let mut slots = self.dbis.write();
        for &dbi in dbis {
            if let Some(slot) = slots.get_mut(dbi as usize) {
                if dbi >= CORE_DBS {
                    slot.valid = false;
                }
            }
        }
    }

    pub(crate) fn slot_by_name(&self, name: &str) -> Option<DbSlot> {
        self.dbis
            .read()
            .iter()
            .find(|s| s.valid && s.name.as_deref() == Some(name))
            .cloned()
    }

    pub(crate) fn set_main_flags(&self, flags: DbFlags) {
        if let Some(slot) = self.dbis.write().get_mut(MAIN_DBI as usize) {
            slot.flags = flags;
        }
    }

    fn update_slot(&self, db: Database, f: impl FnOnce(&mut DbSlot)) -> Result<()> {
        let mut dbis = self.dbis.write();
        match dbis.get_mut(db.0 as usize) {
            Some(slot) if slot.valid && db.0 != FREE_DBI => {
                f(slot);
                Ok(())
            }
            _ => Err(KvError::BadDbi),
        }
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "env.close");
    }
}

fn round_up(n: u64, to: u64) -> u64 {
    n.div_ceil(to) * to
}

fn lock_sibling(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_owned();
    name.push("-lock");
    PathBuf::from(name)
}

fn init_file(io: &StdFileIo, opts: &EnvOptions) -> Result<()> {
    let psize = opts.page_size as usize;
    let map_size = round_up(opts.map_size, psize as u64);
    let meta = Meta::initial(opts.page_size, map_size, DbFlags::INTEGER_KEY.to_record());
    let mut buf = vec![0u8; psize * 2];
    encode_meta(&meta, 0, &mut buf[..psize]);
    encode_meta(&meta, 1, &mut buf[psize..]);
    io.write_at(0, &buf)?;
    io.sync_all()?;
    info!(page_size = psize, map_size, "env.init_file");
    Ok(())
}

/// An open data file plus its lock file.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl Environment {
    /// Opens (creating when allowed) the environment at `path`.
    ///
    /// Unless `no_sub_dir` is set, `path` is a directory holding `data.mdb`
    /// and `lock.mdb`.
    pub fn open(path: impl AsRef<Path>, options: EnvOptions) -> Result<Self> {
        if let Err(err) = options.validate() {
            warn!(error = %err, "env.bad_options");
            return Err(KvError::Invalid("environment options out of range"));
        }
        let path = path.as_ref().to_path_buf();
        let (data_path, lock_path) = if options.no_sub_dir {
            (path.clone(), lock_sibling(&path))
        } else {
            if !options.read_only {
                fs::create_dir_all(&path)?;
            }
            (path.join("data.mdb"), path.join("lock.mdb"))
        };

        let io = StdFileIo::open(
            &data_path,
            OpenMode {
                read_only: options.read_only,
                file_mode: options.file_mode,
            },
        )?;
        let registration = Registration::claim(fs::canonicalize(&data_path)?)?;
        let (lock, first) = LockFile::open(&lock_path, options.max_readers, options.file_mode)?;

        if io.is_empty()? {
            if options.read_only {
                return Err(KvError::Invalid("data file is empty"));
            }
            init_file(&io, &options)?;
        }
        let meta = load_meta(&io)?;
        let page_size = meta.page_size as usize;
        let psize = page_size as u64;
        let used = (meta.last_pgno.0 + 1) * psize;
        let map_size = round_up(options.map_size.max(meta.map_size).max(used), psize);
        let writable = options.write_map && !options.read_only;
        if writable && io.len()? < map_size {
            io.set_len(map_size)?;
        }
        let map = Map::open(io.file(), map_size as usize, page_size, writable)?;
        if first {
            lock.set_txnid(meta.txnid.0);
        }

        let dbis = vec![
            DbSlot::core(DbFlags::INTEGER_KEY),
            DbSlot::core(DbFlags::from_record(meta.main.flags)),
        ];
        info!(
            path = %path.display(),
            page_size,
            map_size,
            txnid = meta.txnid.0,
            first,
            "env.open"
        );
        let readers = ReaderRegistry::new(lock.clone());
        Ok(Self {
            inner: Arc::new(EnvInner {
                path,
                data_path,
                lock_path,
                options,
                page_size,
                io,
                lock,
                readers,
                stats: BTreeStats::default(),
                map: RwLock::new(Arc::new(map)),
                map_size: AtomicU64::new(map_size),
                dbis: RwLock::new(dbis),
                fatal: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                _registration: registration,
            }),
        })
    }

    /// Starts a read-only snapshot of the latest commit.
    pub fn begin_ro(&self) -> Result<RoTxn> {
        RoTxn::begin(Arc::clone(&self.inner))
    }

    /// Starts the write transaction, waiting for any other writer.
    pub fn begin_rw(&self) -> Result<RwTxn> {
        RwTxn::begin(Arc::clone(&self.inner))
    }

    /// Path the environment was opened with.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Path of the data file.
    pub fn data_path(&self) -> &Path {
        &self.inner.data_path
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> &Path {
        &self.inner.lock_path
    }

    /// Options the environment was opened with.
    pub fn options(&self) -> &EnvOptions {
        &self.inner.options
    }

    /// Page size of the data file.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Largest key accepted, also the limit for dup-sort values.
    pub fn max_key_size(&self) -> usize {
        btree::max_key_size(self.inner.page_size)
    }

    /// Reader table capacity.
    pub fn max_readers(&self) -> u32 {
        self.inner.lock.max_readers()
    }

    /// Statistics of the main database in the latest commit.
    pub fn stat(&self) -> Result<Stat> {
        self.begin_ro()?.stat(Database::MAIN)
    }

    /// Map and commit figures.
    pub fn info(&self) -> Result<EnvInfo> {
        let meta = self.inner.latest_meta()?;
        Ok(EnvInfo {
            map_size: self.inner.map_size(),
            page_size: meta.page_size,
            last_pgno: meta.last_pgno.0,
            last_txnid: meta.txnid.0,
            max_readers: self.inner.lock.max_readers(),
            num_readers: self.inner.readers.list().len() as u32,
        })
    }

    /// Flushes committed data to disk. Only needed when commits skip
    /// flushing; `force` waits for the flush to finish.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.inner.options.read_only {
            return Err(KvError::Invalid("environment is read-only"));
        }
        if self.inner.writable_map() {
            self.inner.map.read().flush(!force)?;
        } else {
            self.inner.io.sync_data()?;
        }
        debug!(force, "env.sync");
        Ok(())
    }

    /// Grows (or shrinks down to the used size) the map. No transaction of
    /// this process may be running. A size of 0 keeps the current size and
    /// only refreshes the mapping.
    pub fn set_map_size(&self, size: u64) -> Result<()> {
        if self.inner.active.load(Ordering::Acquire) > 0 {
            return Err(KvError::Invalid("transactions are active"));
        }
        let psize = self.inner.page_size as u64;
        let meta = self.inner.latest_meta()?;
        let used = (meta.last_pgno.0 + 1) * psize;
        let wanted = if size == 0 {
            self.inner.map_size().max(meta.map_size)
        } else {
            round_up(size, psize)
        };
        if wanted < used {
            return Err(KvError::Invalid("map size is below the used size"));
        }
        let mut guard = self.inner.map.write();
        self.inner.remap(&mut guard, wanted)?;
        self.inner.map_size.store(wanted, Ordering::Release);
        info!(map_size = wanted, "env.set_map_size");
        Ok(())
    }

    /// Snapshot of the reader table.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.inner.readers.list()
    }

    /// Frees reader slots left behind by dead processes.
    pub fn reader_check(&self) -> Result<usize> {
        self.inner.readers.check()
    }

    /// Tree operation counters since the environment was opened.
    pub fn btree_stats(&self) -> BTreeStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Replaces the key ordering of `db` for this process. Must be set the
    /// same way by every user of the file.
    pub fn set_compare(&self, db: Database, cmp: CompareFn) -> Result<()> {
        self.inner.update_slot(db, |slot| slot.cmp = Some(cmp))
    }

    /// Replaces the value ordering of a dup-sort `db` for this process.
    pub fn set_dup_compare(&self, db: Database, cmp: CompareFn) -> Result<()> {
        self.inner.update_slot(db, |slot| slot.dcmp = Some(cmp))
    }

    pub(crate) fn set_comparators(&self, db: Database, cmp: Option<CompareFn>, dcmp: Option<CompareFn>) -> Result<()> {
        self.inner.update_slot(db, |slot| {
            slot.cmp = cmp;
            slot.dcmp = dcmp;
        })
    }
}
