use std::ops::Range;

use tracing::warn;

use super::page::{self, PageFlags, PAGE_HDR};
use crate::primitives::io::FileIo;
use crate::types::{
    page_crc32, KvError, PageId, Result, TxnId, DATA_VERSION, MAGIC, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};

/// Encoded size of a [`DbRecord`].
pub const DB_RECORD_LEN: usize = 48;

const REC_PAD: Range<usize> = 0..4;
const REC_FLAGS: Range<usize> = 4..6;
const REC_DEPTH: Range<usize> = 6..8;
const REC_BRANCH: Range<usize> = 8..16;
const REC_LEAF: Range<usize> = 16..24;
const REC_OVERFLOW: Range<usize> = 24..32;
const REC_ENTRIES: Range<usize> = 32..40;
const REC_ROOT: Range<usize> = 40..48;

const META_MAGIC: Range<usize> = PAGE_HDR..PAGE_HDR + 4;
const META_VERSION: Range<usize> = PAGE_HDR + 4..PAGE_HDR + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR + 8..PAGE_HDR + 12;
const META_RESERVED: Range<usize> = PAGE_HDR + 12..PAGE_HDR + 16;
const META_MAP_SIZE: Range<usize> = PAGE_HDR + 16..PAGE_HDR + 24;
const META_FREE_DB: Range<usize> = PAGE_HDR + 24..PAGE_HDR + 24 + DB_RECORD_LEN;
const META_MAIN_DB: Range<usize> = META_FREE_DB.end..META_FREE_DB.end + DB_RECORD_LEN;
const META_LAST_PGNO: Range<usize> = META_MAIN_DB.end..META_MAIN_DB.end + 8;
const META_TXNID: Range<usize> = META_LAST_PGNO.end..META_LAST_PGNO.end + 8;
const META_CRC32: Range<usize> = META_TXNID.end..META_TXNID.end + 4;

/// Bytes of a meta page that carry data; the rest of the page is zero.
pub const META_LEN: usize = META_CRC32.end;

const NO_ROOT: u64 = u64::MAX;

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    page::read_u64(b, 0)
}

/// Root and statistics of one B+tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DbRecord {
    /// Value width of fixed-size duplicates, 0 when unknown.
    pub pad: u32,
    /// Persistent database flags.
    pub flags: u16,
    /// Tree depth, 0 for an empty tree.
    pub depth: u16,
    /// Branch pages in the tree.
    pub branch_pages: u64,
    /// Leaf pages in the tree.
    pub leaf_pages: u64,
    /// Overflow pages owned by the tree.
    pub overflow_pages: u64,
    /// Number of stored items.
    pub entries: u64,
    /// Root page, `None` for an empty tree.
    pub root: Option<PageId>,
}

impl DbRecord {
    /// Empty tree with the given flags.
    pub fn empty(flags: u16) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    /// Serializes into a 48 byte buffer.
    pub fn encode(&self) -> [u8; DB_RECORD_LEN] {
        let mut out = [0u8; DB_RECORD_LEN];
        out[REC_PAD].copy_from_slice(&self.pad.to_be_bytes());
        out[REC_FLAGS].copy_from_slice(&self.flags.to_be_bytes());
        out[REC_DEPTH].copy_from_slice(&self.depth.to_be_bytes());
        out[REC_BRANCH].copy_from_slice(&self.branch_pages.to_be_bytes());
        out[REC_LEAF].copy_from_slice(&self.leaf_pages.to_be_bytes());
        out[REC_OVERFLOW].copy_from_slice(&self.overflow_pages.to_be_bytes());
        out[REC_ENTRIES].copy_from_slice(&self.entries.to_be_bytes());
        let root = self.root.map_or(NO_ROOT, |pg| pg.0);
        out[REC_ROOT].copy_from_slice(&root.to_be_bytes());
        out
    }

    /// Parses a record written by [`DbRecord::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != DB_RECORD_LEN {
            return Err(KvError::Corruption("database record has wrong length"));
        }
        let root = be_u64(&buf[REC_ROOT]);
        Ok(Self {
            pad: be_u32(&buf[REC_PAD]),
            flags: be_u16(&buf[REC_FLAGS]),
            depth: be_u16(&buf[REC_DEPTH]),
            branch_pages: be_u64(&buf[REC_BRANCH]),
            leaf_pages: be_u64(&buf[REC_LEAF]),
            overflow_pages: be_u64(&buf[REC_OVERFLOW]),
            entries: be_u64(&buf[REC_ENTRIES]),
            root: (root != NO_ROOT).then_some(PageId(root)),
        })
    }
}

/// Contents of a meta page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Page size of the data file.
    pub page_size: u32,
    /// Map size in bytes the file was last used with.
    pub map_size: u64,
    /// Free-list database.
    pub free: DbRecord,
    /// Main database.
    pub main: DbRecord,
    /// Highest page number in use.
    pub last_pgno: PageId,
    /// Transaction that wrote this meta.
    pub txnid: TxnId,
}

impl Meta {
    /// Meta of a freshly created file.
    pub fn initial(page_size: u32, map_size: u64, free_flags: u16) -> Self {
        Self {
            page_size,
            map_size,
            free: DbRecord::empty(free_flags),
            main: DbRecord::empty(0),
            last_pgno: PageId(1),
            txnid: TxnId(0),
        }
    }

    /// Meta slot a transaction id writes to.
    pub fn slot_for(txnid: TxnId) -> u64 {
        txnid.0 & 1
    }
}

/// Writes `meta` as the image of meta page `slot` into `buf`.
pub fn encode_meta(meta: &Meta, slot: u64, buf: &mut [u8]) {
    buf.fill(0);
    page::init(buf, PageId(slot), PageFlags::META, 0);
    buf[META_MAGIC].copy_from_slice(&MAGIC.to_be_bytes());
    buf[META_VERSION].copy_from_slice(&DATA_VERSION.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_MAP_SIZE].copy_from_slice(&meta.map_size.to_be_bytes());
    buf[META_FREE_DB].copy_from_slice(&meta.free.encode());
    buf[META_MAIN_DB].copy_from_slice(&meta.main.encode());
    buf[META_LAST_PGNO].copy_from_slice(&meta.last_pgno.0.to_be_bytes());
    buf[META_TXNID].copy_from_slice(&meta.txnid.0.to_be_bytes());
    let crc = page_crc32(slot, &buf[..META_CRC32.start]);
    buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Parses meta page `slot`. `buf` must hold at least [`META_LEN`] bytes.
pub fn decode_meta(buf: &[u8], slot: u64) -> Result<Meta> {
    if buf.len() < META_LEN {
        return Err(KvError::Corruption("meta page truncated"));
    }
    let magic = be_u32(&buf[META_MAGIC]);
    if magic != MAGIC {
        return Err(KvError::Corruption("meta magic mismatch"));
    }
    let stored = be_u32(&buf[META_CRC32]);
    if stored != page_crc32(slot, &buf[..META_CRC32.start]) {
        return Err(KvError::Corruption("meta checksum mismatch"));
    }
    if page::pgno(buf) != PageId(slot) || !page::flags(buf).contains(PageFlags::META) {
        return Err(KvError::Corruption("meta page header mismatch"));
    }
    let version = be_u32(&buf[META_VERSION]);
    if version != DATA_VERSION {
        return Err(KvError::VersionMismatch {
            found: version,
            expected: DATA_VERSION,
        });
    }
    let page_size = be_u32(&buf[META_PAGE_SIZE]);
    if !valid_page_size(page_size as usize) {
        return Err(KvError::Corruption("meta page size invalid"));
    }
    Ok(Meta {
        page_size,
        map_size: be_u64(&buf[META_MAP_SIZE]),
        free: DbRecord::decode(&buf[META_FREE_DB])?,
        main: DbRecord::decode(&buf[META_MAIN_DB])?,
        last_pgno: PageId(be_u64(&buf[META_LAST_PGNO])),
        txnid: TxnId(be_u64(&buf[META_TXNID])),
    })
}

/// Whether `size` is a supported page size.
pub fn valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

fn read_slot(io: &dyn FileIo, page_size: usize, slot: u64) -> Result<Meta> {
    let mut buf = vec![0u8; META_LEN];
    io.read_at(slot * page_size as u64, &mut buf)?;
    let meta = decode_meta(&buf, slot)?;
    if meta.page_size as usize != page_size {
        return Err(KvError::Corruption("meta page size disagrees with its slot"));
    }
    Ok(meta)
}

/// Reads both meta pages and returns the newest valid one. A torn or
/// corrupt slot falls back to the other. When page 0 is unreadable the
/// page size is recovered by probing page 1 at every supported size.
pub fn load_meta(io: &dyn FileIo) -> Result<Meta> {
    let mut head = vec![0u8; META_LEN];
    io.read_at(0, &mut head)?;
    let first = decode_meta(&head, 0);
    let page_size = match &first {
        Ok(meta) => meta.page_size as usize,
        Err(KvError::VersionMismatch { found, expected }) => {
            return Err(KvError::VersionMismatch {
                found: *found,
                expected: *expected,
            })
        }
        Err(_) => probe_page_size(io)?,
    };
    let second = read_slot(io, page_size, 1);
    match (first, second) {
        (Ok(a), Ok(b)) => Ok(if b.txnid > a.txnid { b } else { a }),
        (Ok(a), Err(err)) => {
            warn!(error = %err, txnid = a.txnid.0, "meta.fallback");
            Ok(a)
        }
        (Err(err), Ok(b)) => {
            warn!(error = %err, txnid = b.txnid.0, "meta.fallback");
            Ok(b)
        }
        (Err(err), Err(_)) => Err(err),
    }
}

fn probe_page_size(io: &dyn FileIo) -> Result<usize> {
    let mut size = MIN_PAGE_SIZE;
    while size <= MAX_PAGE_SIZE {
        if let Ok(meta) = read_slot(io, size, 1) {
            return Ok(meta.page_size as usize);
        }
        size *= 2;
    }
    Err(KvError::Corruption("no valid meta page"))
}
