//! Identifiers, the error type, and format constants shared by every layer.
#![forbid(unsafe_code)]

use std::fmt;

pub mod checksum;

pub use checksum::page_crc32;

/// Page number inside the data file. Page `n` lives at byte offset `n * page_size`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

/// Transaction id. Committed ids grow by one per write transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

impl PageId {
    /// Byte offset of this page for the given page size.
    pub fn offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl TxnId {
    /// Id reserved for "no snapshot" in reader slots.
    pub const NONE: TxnId = TxnId(u64::MAX);
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Magic number stored in every meta page.
pub const MAGIC: u32 = 0xBEEF_C0DE;
/// Data file format version.
pub const DATA_VERSION: u32 = 1;
/// Lock file format version.
pub const LOCK_VERSION: u32 = 1;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size; node offsets are 16 bit.
pub const MAX_PAGE_SIZE: usize = 32768;
/// Page size used when the caller does not choose one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;
/// Upper bound on key length regardless of page size.
pub const MAX_KEY_SIZE: usize = 511;
/// Maximum tree depth a cursor can track.
pub const CURSOR_STACK: usize = 32;
/// Database slot of the free list.
pub const FREE_DBI: u32 = 0;
/// Database slot of the unnamed main database.
pub const MAIN_DBI: u32 = 1;
/// Number of databases that always exist.
pub const CORE_DBS: u32 = 2;

/// Errors returned by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum KvError {
    /// Underlying file or mapping error.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Key or cursor position absent.
    #[error("key/data pair not found")]
    NotFound,
    /// A no-overwrite put found an existing item.
    #[error("key/data pair already exists")]
    KeyExist,
    /// The map has no room for more pages.
    #[error("environment map size limit reached")]
    MapFull,
    /// No free slot for another named database.
    #[error("named database limit reached")]
    DbsFull,
    /// No free slot in the reader table.
    #[error("reader table is full")]
    ReadersFull,
    /// Dirty pages exceed the configured cap even after spilling.
    #[error("transaction has too many dirty pages")]
    TxnFull,
    /// Tree deeper than the cursor stack.
    #[error("cursor stack too deep")]
    CursorFull,
    /// Node did not fit where the size accounting said it would.
    #[error("page has no room for node")]
    PageFull,
    /// On-disk structure is inconsistent.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// File was written by an incompatible format version.
    #[error("version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version read from disk.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
    /// Environment hit a fatal error earlier and refuses new work.
    #[error("environment hit a fatal error and must be reopened")]
    Panic,
    /// Transaction failed earlier and must be aborted.
    #[error("transaction is unusable and must be aborted")]
    BadTxn,
    /// Database handle is unknown or was withdrawn.
    #[error("invalid or stale database handle")]
    BadDbi,
    /// Operation does not match the database configuration.
    #[error("incompatible operation: {0}")]
    Incompatible(&'static str),
    /// Key or value has an unsupported size.
    #[error("unsupported key or value size")]
    BadValSize,
    /// Caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

impl KvError {
    /// Whether a write transaction that produced this error must be aborted.
    pub(crate) fn poisons_txn(&self) -> bool {
        !matches!(
            self,
            KvError::NotFound
                | KvError::KeyExist
                | KvError::BadValSize
                | KvError::Incompatible(_)
                | KvError::Invalid(_)
                | KvError::BadDbi
        )
    }

    /// Whether the whole environment must be treated as unusable.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            KvError::Corruption(_) | KvError::VersionMismatch { .. } | KvError::PageFull
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, KvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_errors_leave_txn_usable() {
        assert!(!KvError::NotFound.poisons_txn());
        assert!(!KvError::KeyExist.poisons_txn());
        assert!(!KvError::BadValSize.poisons_txn());
        assert!(KvError::MapFull.poisons_txn());
        assert!(KvError::TxnFull.poisons_txn());
        assert!(KvError::Corruption("x").poisons_txn());
    }

    #[test]
    fn corruption_is_fatal() {
        assert!(KvError::Corruption("bad page").is_fatal());
        assert!(KvError::VersionMismatch {
            found: 9,
            expected: DATA_VERSION
        }
        .is_fatal());
        assert!(!KvError::MapFull.is_fatal());
    }

    #[test]
    fn page_offsets_scale_with_size() {
        assert_eq!(PageId(3).offset(4096), 12288);
        assert_eq!(PageId(0).offset(512), 0);
    }
}
