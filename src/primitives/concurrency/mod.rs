//! Process-shared coordination through the lock file.
//!
//! The lock file carries a small header with the last committed txnid and
//! an array of reader slots, all accessed as atomics through a shared
//! mapping. Three single-byte regions are used as OS locks:
//!
//! * byte 0: liveness. The first opener holds it exclusively while it resets
//!   the table, then everybody holds it shared until close.
//! * byte 1: the single writer.
//! * byte 2: the reader-table mutex, held only while claiming a slot.
//!
//! Byte-range locks belong to the process, so each region is paired with an
//! in-process `parking_lot` mutex.
#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};
use tracing::debug;

use crate::types::{KvError, Result, LOCK_VERSION};

/// Magic number at the start of the lock file.
pub const LOCK_MAGIC: u32 = 0xBEEF_C0DE ^ 0x4C4F_434B;
/// Bytes reserved for the lock file header.
pub const LOCK_HEADER_LEN: usize = 64;
/// Bytes per reader slot.
pub const READER_SLOT_LEN: usize = 32;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_TXNID: usize = 8;
const OFF_NUM_READERS: usize = 16;

const SLOT_TXNID: usize = 0;
const SLOT_PID: usize = 8;
const SLOT_TID: usize = 16;

#[derive(Copy, Clone, Debug)]
enum Region {
    Liveness,
    Writer,
    ReaderTable,
}

impl Region {
    fn start(self) -> u64 {
        match self {
            Region::Liveness => 0,
            Region::Writer => 1,
            Region::ReaderTable => 2,
        }
    }
}

/// Shared lock file handle.
#[derive(Clone)]
pub struct LockFile {
    inner: Arc<Inner>,
}

struct Inner {
    file: File,
    map: MmapRaw,
    max_readers: u32,
    writer: Arc<Mutex<()>>,
    table: Mutex<()>,
}

/// Atomic view of one reader slot.
pub struct SlotRef<'a> {
    /// Snapshot txnid, or `u64::MAX` when idle.
    pub txnid: &'a AtomicU64,
    /// Owning process id, 0 when free.
    pub pid: &'a AtomicU32,
    /// Owning thread id.
    pub tid: &'a AtomicU64,
}

/// Held writer lock. Dropping it releases both the OS lock and the
/// in-process mutex.
pub struct WriterGuard {
    lock: LockFile,
    _local: ArcMutexGuard<RawMutex, ()>,
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        if let Err(err) = unlock_region(&self.lock.inner.file, Region::Writer.start(), 1) {
            tracing::warn!(error = %err, "lock.writer_unlock_failed");
        }
    }
}

impl LockFile {
    /// Opens or creates the lock file. Returns the handle and whether this
    /// process initialised the table (no other process had it open).
    pub fn open(path: impl AsRef<Path>, max_readers: u32, file_mode: u32) -> Result<(Self, bool)> {
        let path = path.as_ref();
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(file_mode);
        }
        #[cfg(not(unix))]
        let _ = file_mode;
        let file = opts.open(path)?;

        let first = lock_region(&file, Region::Liveness.start(), 1, true, false)?;
        let (max_readers, len) = if first {
            let len = LOCK_HEADER_LEN + READER_SLOT_LEN * max_readers as usize;
            file.set_len(len as u64)?;
            (max_readers, len)
        } else {
            lock_region(&file, Region::Liveness.start(), 1, false, true)?;
            let len = file.metadata()?.len() as usize;
            if len < LOCK_HEADER_LEN {
                return Err(KvError::Corruption("lock file truncated"));
            }
            (((len - LOCK_HEADER_LEN) / READER_SLOT_LEN) as u32, len)
        };
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        let lock = Self {
            inner: Arc::new(Inner {
                file,
                map,
                max_readers,
                writer: Arc::new(Mutex::new(())),
                table: Mutex::new(()),
            }),
        };
        if first {
            lock.reset();
            // Downgrade to shared so later openers can join.
            lock_region(&lock.inner.file, Region::Liveness.start(), 1, false, true)?;
        } else {
            let magic = lock.u32_at(OFF_MAGIC).load(Ordering::Acquire);
            let format = lock.u32_at(OFF_FORMAT).load(Ordering::Acquire);
            if magic != LOCK_MAGIC {
                return Err(KvError::Corruption("lock file magic mismatch"));
            }
            if format != LOCK_VERSION {
                return Err(KvError::VersionMismatch {
                    found: format,
                    expected: LOCK_VERSION,
                });
            }
        }
        debug!(path = %path.display(), first, max_readers, "lock.open");
        Ok((lock, first))
    }

    fn reset(&self) {
        self.u32_at(OFF_MAGIC).store(LOCK_MAGIC, Ordering::Release);
        self.u32_at(OFF_FORMAT).store(LOCK_VERSION, Ordering::Release);
        self.u64_at(OFF_TXNID).store(0, Ordering::Release);
        self.u32_at(OFF_NUM_READERS).store(0, Ordering::Release);
        for idx in 0..self.inner.max_readers {
            let slot = self.slot(idx);
            slot.pid.store(0, Ordering::Release);
            slot.tid.store(0, Ordering::Release);
            slot.txnid.store(u64::MAX, Ordering::Release);
        }
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.inner.map.len());
        // SAFETY: offset is 8-aligned and inside the mapping, which lives as
        // long as `self`. Every process touches this word only atomically.
        unsafe { &*(self.inner.map.as_mut_ptr().add(off) as *const AtomicU64) }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.inner.map.len());
        // SAFETY: as for `u64_at`.
        unsafe { &*(self.inner.map.as_mut_ptr().add(off) as *const AtomicU32) }
    }

    /// Number of slots in the reader table.
    pub fn max_readers(&self) -> u32 {
        self.inner.max_readers
    }

    /// Last committed txnid published by a writer.
    pub fn txnid(&self) -> u64 {
        self.u64_at(OFF_TXNID).load(Ordering::Acquire)
    }

    /// Publishes a newly committed txnid.
    pub fn set_txnid(&self, txnid: u64) {
        self.u64_at(OFF_TXNID).store(txnid, Ordering::Release);
    }

    /// High-water mark of slots ever handed out.
    pub fn num_readers(&self) -> u32 {
        self.u32_at(OFF_NUM_READERS).load(Ordering::Acquire)
    }

    /// Raises the slot high-water mark. Call only under [`LockFile::with_table`].
    pub fn set_num_readers(&self, n: u32) {
        self.u32_at(OFF_NUM_READERS).store(n, Ordering::Release);
    }

    /// Atomic accessors for slot `idx`.
    pub fn slot(&self, idx: u32) -> SlotRef<'_> {
        let base = LOCK_HEADER_LEN + idx as usize * READER_SLOT_LEN;
        SlotRef {
            txnid: self.u64_at(base + SLOT_TXNID),
            pid: self.u32_at(base + SLOT_PID),
            tid: self.u64_at(base + SLOT_TID),
        }
    }

    /// Runs `f` while holding the reader-table mutex.
    pub fn with_table<R>(&self, f: impl FnOnce(&Self) -> R) -> Result<R> {
        let _local = self.inner.table.lock();
        lock_region(&self.inner.file, Region::ReaderTable.start(), 1, true, true)?;
        let out = f(self);
        unlock_region(&self.inner.file, Region::ReaderTable.start(), 1)?;
        Ok(out)
    }

    /// Blocks until this thread is the only writer on the machine.
    pub fn lock_writer(&self) -> Result<WriterGuard> {
        let local = self.inner.writer.lock_arc();
        lock_region(&self.inner.file, Region::Writer.start(), 1, true, true)?;
        Ok(WriterGuard {
            lock: self.clone(),
            _local: local,
        })
    }

    /// Attempts to take the writer lock without blocking.
    pub fn try_lock_writer(&self) -> Result<Option<WriterGuard>> {
        let Some(local) = self.inner.writer.try_lock_arc() else {
            return Ok(None);
        };
        if !lock_region(&self.inner.file, Region::Writer.start(), 1, true, false)? {
            return Ok(None);
        }
        Ok(Some(WriterGuard {
            lock: self.clone(),
            _local: local,
        }))
    }
}

fn lock_region(file: &File, start: u64, len: u64, exclusive: bool, blocking: bool) -> Result<bool> {
    lock_region_inner(file, start, len, exclusive, blocking).map_err(KvError::from)
}

fn lock_region_inner(
    file: &File,
    start: u64,
    len: u64,
    exclusive: bool,
    blocking: bool,
) -> io::Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len, exclusive, blocking)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len, exclusive, blocking)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len, exclusive, blocking);
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "file locking unsupported on this platform",
        ))
    }
}

fn unlock_region(file: &File, start: u64, len: u64) -> Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len).map_err(KvError::from)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len).map_err(KvError::from)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Err(KvError::Invalid("file locking unsupported on this platform"))
    }
}

/// Whether process `pid` still exists.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: signal 0 performs only the existence and permission check.
        let res = unsafe { libc::kill(pid as libc::pid_t, 0) };
        res == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_region(
        file: &File,
        start: u64,
        len: u64,
        exclusive: bool,
        blocking: bool,
    ) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let l_type = if exclusive {
            libc::F_WRLCK
        } else {
            libc::F_RDLCK
        };
        let mut flock = libc::flock {
            l_type: l_type as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        let cmd = if blocking {
            libc::F_SETLKW
        } else {
            libc::F_SETLK
        };
        loop {
            // SAFETY: fd is owned by `file`; flock is a valid, initialised struct.
            let res = unsafe { libc::fcntl(fd, cmd, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) if blocking => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: start as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };
        // SAFETY: as above.
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(
        file: &File,
        start: u64,
        len: u64,
        exclusive: bool,
        blocking: bool,
    ) -> io::Result<bool> {
        // LockFileEx cannot convert a held lock, so drop any previous one on
        // this region first (used when downgrading the liveness lock).
        let _ = unlock_region(file, start, len);
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let mut flags = 0;
            if exclusive {
                flags |= LOCKFILE_EXCLUSIVE_LOCK;
            }
            if !blocking {
                flags |= LOCKFILE_FAIL_IMMEDIATELY;
            }
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if !blocking && matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION)
                {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn unlock_region(file: &File, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let res = UnlockFileEx(
                handle as isize,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
