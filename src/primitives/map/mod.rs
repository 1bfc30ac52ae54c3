//! Shared memory map of the data file.
//!
//! Readers borrow page slices straight out of the mapping. Writers never
//! modify a page that a live snapshot can reach, so a slice handed out here
//! stays stable for as long as the owning transaction holds the [`Map`].
#![allow(unsafe_code)]

use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use crate::types::{KvError, PageId, Result};

/// A fixed-length mapping of the data file.
pub struct Map {
    raw: MmapRaw,
    writable: bool,
    page_size: usize,
}

impl Map {
    /// Maps `len` bytes of `file`. The file may be shorter than the mapping;
    /// only pages that exist on disk are ever touched.
    pub fn open(file: &File, len: usize, page_size: usize, writable: bool) -> Result<Self> {
        if len == 0 || len % page_size != 0 {
            return Err(KvError::Invalid("map length must be a page multiple"));
        }
        let mut opts = MmapOptions::new();
        opts.len(len);
        let raw = if writable {
            opts.map_raw(file)?
        } else {
            opts.map_raw_read_only(file)?
        };
        debug!(len, writable, "map.open");
        Ok(Self {
            raw,
            writable,
            page_size,
        })
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.raw.len() == 0
    }

    /// Number of whole pages covered by the mapping.
    pub fn pages(&self) -> u64 {
        (self.raw.len() / self.page_size) as u64
    }

    /// Page size the mapping was opened with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether writes through the mapping are allowed.
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Borrows `count` consecutive pages starting at `pgno`.
    pub fn pages_at(&self, pgno: PageId, count: usize) -> Result<&[u8]> {
        let start = pgno.0 as usize * self.page_size;
        let len = count * self.page_size;
        if count == 0 || pgno.0 >= self.pages() || start + len > self.raw.len() {
            return Err(KvError::Corruption("page number beyond map"));
        }
        // SAFETY: the range is inside the mapping, and the region belongs to
        // a committed or spilled page that no writer modifies while readers
        // of this snapshot are alive.
        Ok(unsafe { std::slice::from_raw_parts(self.raw.as_ptr().add(start), len) })
    }

    /// Copies `src` into the mapping at byte offset `off`.
    pub fn write(&self, off: usize, src: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(KvError::Invalid("map is read-only"));
        }
        if off + src.len() > self.raw.len() {
            return Err(KvError::MapFull);
        }
        // SAFETY: bounds checked above; the target pages are dirty pages of
        // the single writer and are not visible to any reader snapshot.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.raw.as_mut_ptr().add(off), src.len());
        }
        Ok(())
    }

    /// Flushes modified mapped pages to the file.
    pub fn flush(&self, asynchronous: bool) -> Result<()> {
        if asynchronous {
            self.raw.flush_async()?;
        } else {
            self.raw.flush()?;
        }
        Ok(())
    }
}
