//! Page and node layout.
//!
//! Every page starts with a 16 byte header. Branch and leaf pages follow it
//! with a table of `u16` node offsets that grows upwards while node bodies
//! are packed downwards from the end of the page. LEAF2 pages instead store
//! fixed-size keys back to back right after the header. Overflow pages keep
//! their run length where `lower`/`upper` would be and hold raw data.
//!
//! The same functions work on inline sub-pages embedded in a leaf node, in
//! which case the "page size" is the length of the slice.
#![forbid(unsafe_code)]

use std::cmp::Ordering;

use bitflags::bitflags;

use crate::types::{KvError, PageId, Result};

/// Bytes in a page header.
pub const PAGE_HDR: usize = 16;
/// Bytes in a node header.
pub const NODE_HDR: usize = 8;
/// Bytes of one pointer-table entry.
const PTR: usize = 2;

/// Byte ranges of the header fields.
pub mod header {
    use core::ops::Range;

    pub const PGNO: Range<usize> = 0..8;
    pub const PAD: Range<usize> = 8..10;
    pub const FLAGS: Range<usize> = 10..12;
    pub const LOWER: Range<usize> = 12..14;
    pub const UPPER: Range<usize> = 14..16;
    pub const OVERFLOW_PAGES: Range<usize> = 12..16;
}

bitflags! {
    /// Page type and state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        /// Branch page routing to children.
        const BRANCH = 0x01;
        /// Leaf page holding data.
        const LEAF = 0x02;
        /// First page of an overflow run.
        const OVERFLOW = 0x04;
        /// Meta page.
        const META = 0x08;
        /// Page is a dirty copy inside a write transaction.
        const DIRTY = 0x10;
        /// Leaf of fixed-size keys without node headers.
        const LEAF2 = 0x20;
        /// Inline sub-page stored inside a leaf node.
        const SUBP = 0x40;
    }
}

bitflags! {
    /// Leaf node bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u16 {
        /// Data lives in an overflow run; the node holds its page number.
        const BIGDATA = 0x01;
        /// Data is a database record (sub-tree or named database).
        const SUBDATA = 0x02;
        /// Data holds duplicate values (sub-page or sub-tree).
        const DUPDATA = 0x04;
    }
}

/// Payload of a node about to be inserted.
#[derive(Clone, Copy, Debug)]
pub enum NodeData<'a> {
    /// Data stored inside the node.
    Inline {
        /// Leaf node flags.
        flags: NodeFlags,
        /// Bytes copied into the node.
        data: &'a [u8],
    },
    /// Data stored in an overflow run.
    Overflow {
        /// Length of the value.
        size: usize,
        /// First page of the run.
        pgno: PageId,
    },
    /// Branch node pointing at a child page.
    Child(PageId),
}

impl NodeData<'_> {
    fn stored_len(&self) -> usize {
        match self {
            NodeData::Inline { data, .. } => data.len(),
            NodeData::Overflow { .. } => 8,
            NodeData::Child(_) => 0,
        }
    }
}

#[inline]
fn even(n: usize) -> usize {
    (n + 1) & !1
}

#[inline]
fn read_u16(p: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([p[off], p[off + 1]])
}

#[inline]
fn write_u16(p: &mut [u8], off: usize, v: u16) {
    p[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
fn read_u32(p: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([p[off], p[off + 1], p[off + 2], p[off + 3]])
}

/// Reads a big-endian u64 at `off`.
#[inline]
pub fn read_u64(p: &[u8], off: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&p[off..off + 8]);
    u64::from_be_bytes(arr)
}

/// Page number stored in the header.
pub fn pgno(p: &[u8]) -> PageId {
    PageId(read_u64(p, header::PGNO.start))
}

/// Sets the header page number.
pub fn set_pgno(p: &mut [u8], pgno: PageId) {
    p[header::PGNO].copy_from_slice(&pgno.0.to_be_bytes());
}

/// Header flags.
pub fn flags(p: &[u8]) -> PageFlags {
    PageFlags::from_bits_truncate(read_u16(p, header::FLAGS.start))
}

/// Replaces the header flags.
pub fn set_flags(p: &mut [u8], flags: PageFlags) {
    write_u16(p, header::FLAGS.start, flags.bits());
}

/// Key width of a LEAF2 page.
pub fn pad(p: &[u8]) -> usize {
    read_u16(p, header::PAD.start) as usize
}

fn lower(p: &[u8]) -> usize {
    read_u16(p, header::LOWER.start) as usize
}

fn upper(p: &[u8]) -> usize {
    read_u16(p, header::UPPER.start) as usize
}

fn set_lower(p: &mut [u8], v: usize) {
    write_u16(p, header::LOWER.start, v as u16);
}

fn set_upper(p: &mut [u8], v: usize) {
    write_u16(p, header::UPPER.start, v as u16);
}

/// Pages in an overflow run, read from its first page.
pub fn overflow_pages(p: &[u8]) -> usize {
    read_u32(p, header::OVERFLOW_PAGES.start) as usize
}

/// Pages needed to hold `len` bytes in an overflow run.
pub fn overflow_count(page_size: usize, len: usize) -> usize {
    (PAGE_HDR + len).div_ceil(page_size)
}

/// Formats `p` as an empty page. `pad` is the key width for LEAF2 pages.
pub fn init(p: &mut [u8], pgno: PageId, flags: PageFlags, pad: usize) {
    p[..PAGE_HDR].fill(0);
    set_pgno(p, pgno);
    write_u16(p, header::PAD.start, pad as u16);
    set_flags(p, flags);
    set_lower(p, PAGE_HDR);
    let len = p.len().min(u16::MAX as usize);
    set_upper(p, len);
}

/// Formats the first page of an overflow run of `count` pages.
pub fn init_overflow(p: &mut [u8], pgno: PageId, count: usize) {
    p[..PAGE_HDR].fill(0);
    set_pgno(p, pgno);
    set_flags(p, PageFlags::OVERFLOW);
    p[header::OVERFLOW_PAGES].copy_from_slice(&(count as u32).to_be_bytes());
}

/// Whether the page is a leaf (including LEAF2).
pub fn is_leaf(p: &[u8]) -> bool {
    flags(p).contains(PageFlags::LEAF)
}

/// Whether the page is a branch.
pub fn is_branch(p: &[u8]) -> bool {
    flags(p).contains(PageFlags::BRANCH)
}

/// Whether keys are stored without node headers.
pub fn is_leaf2(p: &[u8]) -> bool {
    flags(p).contains(PageFlags::LEAF2)
}

/// Number of entries on the page.
pub fn num_keys(p: &[u8]) -> usize {
    let used = lower(p).saturating_sub(PAGE_HDR);
    if is_leaf2(p) {
        match pad(p) {
            0 => 0,
            ks => used / ks,
        }
    } else {
        used / PTR
    }
}

/// Unused bytes between the pointer table and the node area.
pub fn free_space(p: &[u8]) -> usize {
    upper(p).saturating_sub(lower(p))
}

/// Bytes in use below the header.
pub fn used_space(p: &[u8]) -> usize {
    p.len() - PAGE_HDR - free_space(p)
}

/// Fill factor in tenths of a percent.
pub fn fill_permille(p: &[u8]) -> usize {
    used_space(p) * 1000 / (p.len() - PAGE_HDR)
}

/// Checks header invariants of a branch or leaf page.
pub fn validate(p: &[u8]) -> Result<()> {
    if p.len() < PAGE_HDR {
        return Err(KvError::Corruption("page shorter than header"));
    }
    let f = flags(p);
    if f.contains(PageFlags::BRANCH) == f.contains(PageFlags::LEAF) {
        return Err(KvError::Corruption("page is neither branch nor leaf"));
    }
    let (lo, up) = (lower(p), upper(p));
    if lo < PAGE_HDR || lo > up || up > p.len() {
        return Err(KvError::Corruption("page bounds out of range"));
    }
    if f.contains(PageFlags::LEAF2) && pad(p) == 0 {
        return Err(KvError::Corruption("leaf2 page without key width"));
    }
    Ok(())
}

fn ptr(p: &[u8], idx: usize) -> usize {
    read_u16(p, PAGE_HDR + idx * PTR) as usize
}

fn set_ptr(p: &mut [u8], idx: usize, off: usize) {
    write_u16(p, PAGE_HDR + idx * PTR, off as u16);
}

/// Size of a leaf node with inline data, excluding its pointer.
pub fn leaf_node_size(key_len: usize, data_len: usize) -> usize {
    even(NODE_HDR + key_len + data_len)
}

/// Size of a node, excluding its pointer.
pub fn node_size(key_len: usize, data: &NodeData<'_>) -> usize {
    even(NODE_HDR + key_len + data.stored_len())
}

/// Bytes a node consumes on the page including its pointer.
pub fn node_cost(key_len: usize, data: &NodeData<'_>) -> usize {
    node_size(key_len, data) + PTR
}

/// View of one node on a page.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    page: &'a [u8],
    off: usize,
    branch: bool,
}

impl<'a> Node<'a> {
    fn lo(&self) -> u32 {
        read_u32(self.page, self.off)
    }

    fn hi(&self) -> u16 {
        read_u16(self.page, self.off + 4)
    }

    /// Key length.
    pub fn ksize(&self) -> usize {
        read_u16(self.page, self.off + 6) as usize
    }

    /// Leaf node flags; empty for branch nodes.
    pub fn flags(&self) -> NodeFlags {
        if self.branch {
            NodeFlags::empty()
        } else {
            NodeFlags::from_bits_truncate(self.hi())
        }
    }

    /// Key bytes.
    pub fn key(&self) -> &'a [u8] {
        let start = self.off + NODE_HDR;
        &self.page[start..start + self.ksize()]
    }

    /// Logical value length (overflow values report their full size).
    pub fn data_size(&self) -> usize {
        if self.branch {
            0
        } else {
            self.lo() as usize
        }
    }

    fn stored_len(&self) -> usize {
        if self.branch {
            0
        } else if self.flags().contains(NodeFlags::BIGDATA) {
            8
        } else {
            self.lo() as usize
        }
    }

    /// Bytes stored in the node after the key.
    pub fn data(&self) -> &'a [u8] {
        let start = self.off + NODE_HDR + self.ksize();
        &self.page[start..start + self.stored_len()]
    }

    /// Child page of a branch node.
    pub fn child(&self) -> PageId {
        PageId(self.lo() as u64 | (self.hi() as u64) << 32)
    }

    /// First page of the overflow run of a BIGDATA node.
    pub fn overflow_pgno(&self) -> PageId {
        PageId(read_u64(self.data(), 0))
    }

    /// Whole node encoding, padded to even length.
    pub fn raw(&self) -> &'a [u8] {
        let len = even(NODE_HDR + self.ksize() + self.stored_len());
        &self.page[self.off..self.off + len]
    }
}

/// Returns node `idx` after validating that it lies inside the page.
pub fn node(p: &[u8], idx: usize) -> Result<Node<'_>> {
    if idx >= num_keys(p) {
        return Err(KvError::Corruption("node index out of range"));
    }
    let off = ptr(p, idx);
    if off < upper(p) || off + NODE_HDR > p.len() {
        return Err(KvError::Corruption("node offset out of range"));
    }
    let node = Node {
        page: p,
        off,
        branch: is_branch(p),
    };
    if off + NODE_HDR + node.ksize() + node.stored_len() > p.len() {
        return Err(KvError::Corruption("node extends past page"));
    }
    Ok(node)
}

/// Key `idx` of a LEAF2 page.
pub fn leaf2_key(p: &[u8], idx: usize) -> Result<&[u8]> {
    let ks = pad(p);
    if idx >= num_keys(p) {
        return Err(KvError::Corruption("leaf2 index out of range"));
    }
    let start = PAGE_HDR + idx * ks;
    Ok(&p[start..start + ks])
}

/// Key of entry `idx` regardless of page kind.
pub fn key_at(p: &[u8], idx: usize) -> Result<&[u8]> {
    if is_leaf2(p) {
        leaf2_key(p, idx)
    } else {
        Ok(node(p, idx)?.key())
    }
}

/// Encoded bytes of entry `idx`: the raw node, or the key on LEAF2 pages.
pub fn raw_entry(p: &[u8], idx: usize) -> Result<&[u8]> {
    if is_leaf2(p) {
        leaf2_key(p, idx)
    } else {
        Ok(node(p, idx)?.raw())
    }
}

/// Binary search for `key`. Returns the index of the first entry not less
/// than `key` and whether it matched exactly. Branch pages skip entry 0,
/// whose key is always empty.
pub fn search(
    p: &[u8],
    key: &[u8],
    cmp: impl Fn(&[u8], &[u8]) -> Ordering,
) -> Result<(usize, bool)> {
    let n = num_keys(p);
    let mut lo = usize::from(is_branch(p));
    let mut hi = n;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(key, key_at(p, mid)?) {
            Ordering::Less => hi = mid,
            Ordering::Greater => lo = mid + 1,
            Ordering::Equal => return Ok((mid, true)),
        }
    }
    Ok((lo, false))
}

fn reserve_node(p: &mut [u8], idx: usize, size: usize) -> Result<usize> {
    let n = num_keys(p);
    if idx > n {
        return Err(KvError::Corruption("insert index out of range"));
    }
    if free_space(p) < size + PTR {
        return Err(KvError::PageFull);
    }
    for j in (idx..n).rev() {
        let off = ptr(p, j);
        set_ptr(p, j + 1, off);
    }
    let off = upper(p) - size;
    set_upper(p, off);
    set_ptr(p, idx, off);
    set_lower(p, lower(p) + PTR);
    Ok(off)
}

/// Encodes a node the way [`insert_node`] lays it out on a page.
pub fn encode_node(key: &[u8], data: NodeData<'_>) -> Result<Vec<u8>> {
    let mut p = vec![0u8; PAGE_HDR + node_cost(key.len(), &data)];
    let flags = match data {
        NodeData::Child(_) => PageFlags::BRANCH,
        _ => PageFlags::LEAF,
    };
    init(&mut p, PageId(0), flags, 0);
    insert_node(&mut p, 0, key, data)?;
    let off = ptr(&p, 0);
    Ok(p[off..].to_vec())
}

/// Key of an encoded node.
pub fn raw_key(raw: &[u8]) -> &[u8] {
    let ks = read_u16(raw, 6) as usize;
    &raw[NODE_HDR..NODE_HDR + ks]
}

/// Child page of an encoded branch node.
pub fn raw_child(raw: &[u8]) -> PageId {
    PageId(read_u32(raw, 0) as u64 | (read_u16(raw, 4) as u64) << 32)
}

/// Bytes an encoded entry consumes on a page of the given kind.
pub fn entry_cost(raw: &[u8], leaf2: bool) -> usize {
    if leaf2 {
        raw.len()
    } else {
        even(raw.len()) + PTR
    }
}

/// Inserts a node at `idx`.
pub fn insert_node(p: &mut [u8], idx: usize, key: &[u8], data: NodeData<'_>) -> Result<()> {
    let size = node_size(key.len(), &data);
    let off = reserve_node(p, idx, size)?;
    let (lo, hi) = match data {
        NodeData::Inline { flags, data } => (data.len() as u32, flags.bits()),
        NodeData::Overflow { size, .. } => (size as u32, NodeFlags::BIGDATA.bits()),
        NodeData::Child(pgno) => (pgno.0 as u32, (pgno.0 >> 32) as u16),
    };
    p[off..off + 4].copy_from_slice(&lo.to_be_bytes());
    write_u16(p, off + 4, hi);
    write_u16(p, off + 6, key.len() as u16);
    let kstart = off + NODE_HDR;
    p[kstart..kstart + key.len()].copy_from_slice(key);
    let dstart = kstart + key.len();
    match data {
        NodeData::Inline { data, .. } => p[dstart..dstart + data.len()].copy_from_slice(data),
        NodeData::Overflow { pgno, .. } => p[dstart..dstart + 8].copy_from_slice(&pgno.0.to_be_bytes()),
        NodeData::Child(_) => {}
    }
    if (dstart + data.stored_len()) % 2 == 1 {
        p[dstart + data.stored_len()] = 0;
    }
    Ok(())
}

/// Inserts a previously encoded node (see [`Node::raw`]) at `idx`.
pub fn insert_raw(p: &mut [u8], idx: usize, raw: &[u8]) -> Result<()> {
    let off = reserve_node(p, idx, even(raw.len()))?;
    p[off..off + raw.len()].copy_from_slice(raw);
    Ok(())
}

/// Inserts a branch node whose key is replaced by `key`.
pub fn insert_branch(p: &mut [u8], idx: usize, key: &[u8], child: PageId) -> Result<()> {
    insert_node(p, idx, key, NodeData::Child(child))
}

/// Inserts a key into a LEAF2 page.
pub fn insert_leaf2(p: &mut [u8], idx: usize, key: &[u8]) -> Result<()> {
    let ks = pad(p);
    let n = num_keys(p);
    if key.len() != ks {
        return Err(KvError::BadValSize);
    }
    if idx > n {
        return Err(KvError::Corruption("insert index out of range"));
    }
    if free_space(p) < ks {
        return Err(KvError::PageFull);
    }
    let base = PAGE_HDR;
    p.copy_within(base + idx * ks..base + n * ks, base + (idx + 1) * ks);
    p[base + idx * ks..base + (idx + 1) * ks].copy_from_slice(key);
    set_lower(p, lower(p) + ks);
    Ok(())
}

/// Inserts an entry produced by [`raw_entry`].
pub fn insert_entry(p: &mut [u8], idx: usize, raw: &[u8]) -> Result<()> {
    if is_leaf2(p) {
        insert_leaf2(p, idx, raw)
    } else {
        insert_raw(p, idx, raw)
    }
}

/// Removes entry `idx` and compacts the node area.
pub fn del_node(p: &mut [u8], idx: usize) -> Result<()> {
    let n = num_keys(p);
    if idx >= n {
        return Err(KvError::Corruption("delete index out of range"));
    }
    if is_leaf2(p) {
        let ks = pad(p);
        let base = PAGE_HDR;
        p.copy_within(base + (idx + 1) * ks..base + n * ks, base + idx * ks);
        set_lower(p, lower(p) - ks);
        return Ok(());
    }
    let (off, size) = {
        let node = node(p, idx)?;
        (ptr(p, idx), node.raw().len())
    };
    for j in 0..n {
        if j == idx {
            continue;
        }
        let other = ptr(p, j);
        if other < off {
            set_ptr(p, j, other + size);
        }
    }
    for j in idx + 1..n {
        let other = ptr(p, j);
        set_ptr(p, j - 1, other);
    }
    let up = upper(p);
    p.copy_within(up..off, up + size);
    set_upper(p, up + size);
    set_lower(p, lower(p) - PTR);
    Ok(())
}

/// Points branch node `idx` at a new child.
pub fn set_child(p: &mut [u8], idx: usize, child: PageId) -> Result<()> {
    node(p, idx)?;
    let off = ptr(p, idx);
    p[off..off + 4].copy_from_slice(&(child.0 as u32).to_be_bytes());
    write_u16(p, off + 4, (child.0 >> 32) as u16);
    Ok(())
}

/// Mutable view of the bytes stored after the key of leaf node `idx`.
pub fn node_data_mut(p: &mut [u8], idx: usize) -> Result<&mut [u8]> {
    let (start, len) = {
        let node = node(p, idx)?;
        (ptr(p, idx) + NODE_HDR + node.ksize(), node.data().len())
    };
    Ok(&mut p[start..start + len])
}

/// Replaces the flags of leaf node `idx`.
pub fn set_node_flags(p: &mut [u8], idx: usize, flags: NodeFlags) -> Result<()> {
    node(p, idx)?;
    let off = ptr(p, idx);
    write_u16(p, off + 4, flags.bits());
    Ok(())
}

/// Removes every entry, keeping page number and flags.
pub fn clear(p: &mut [u8]) {
    set_lower(p, PAGE_HDR);
    let len = p.len().min(u16::MAX as usize);
    set_upper(p, len);
}

/// Builds an exactly sized inline sub-page holding `values` in order.
/// `fixed` gives the value width for LEAF2 sub-pages.
pub fn build_subpage(values: &[&[u8]], fixed: Option<usize>) -> Result<Vec<u8>> {
    match fixed {
        Some(ks) => {
            let len = PAGE_HDR + ks * values.len();
            let mut p = vec![0u8; len];
            init(
                &mut p,
                PageId(0),
                PageFlags::LEAF | PageFlags::LEAF2 | PageFlags::SUBP,
                ks,
            );
            for (idx, value) in values.iter().enumerate() {
                insert_leaf2(&mut p, idx, value)?;
            }
            Ok(p)
        }
        None => {
            let body: usize = values
                .iter()
                .map(|v| leaf_node_size(v.len(), 0) + PTR)
                .sum();
            let mut p = vec![0u8; PAGE_HDR + body];
            init(&mut p, PageId(0), PageFlags::LEAF | PageFlags::SUBP, 0);
            for (idx, value) in values.iter().enumerate() {
                insert_node(
                    &mut p,
                    idx,
                    value,
                    NodeData::Inline {
                        flags: NodeFlags::empty(),
                        data: &[],
                    },
                )?;
            }
            Ok(p)
        }
    }
}

/// Size of a sub-page built by [`build_subpage`].
pub fn subpage_size(values: &[&[u8]], fixed: Option<usize>) -> usize {
    match fixed {
        Some(ks) => PAGE_HDR + ks * values.len(),
        None => {
            PAGE_HDR
                + values
                    .iter()
                    .map(|v| leaf_node_size(v.len(), 0) + PTR)
                    .sum::<usize>()
        }
    }
}
