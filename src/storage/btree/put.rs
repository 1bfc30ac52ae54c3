use tracing::trace;

use super::cursor::{current, descend, seek_item, Target};
use super::dup::dup_put;
use super::{max_key_size, node_max, CursorState, DbRecord, PageSource, PageStore, Path, TreeCfg};
use crate::primitives::pager::page::{self, NodeData, NodeFlags, PageFlags, PAGE_HDR};
use crate::types::{KvError, PageId, Result};

/// Options of a single insert.
#[derive(Clone, Copy, Debug, Default)]
pub struct PutMode {
    /// Fail with `KeyExist` if the key is present.
    pub no_overwrite: bool,
    /// Fail with `KeyExist` if the key/value pair is present (dup-sort only).
    pub no_dup_data: bool,
    /// Replace the item under the cursor; the key must match it.
    pub current: bool,
    /// The key sorts after every key in the tree.
    pub append: bool,
    /// The value sorts after every value of its key (dup-sort only).
    pub append_dup: bool,
    /// Extra leaf node flags, `SUBDATA` for database records.
    pub node_flags: NodeFlags,
}

/// Stores `data` under `key` and leaves the cursor on the new item.
pub fn put<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
    data: &[u8],
    mut mode: PutMode,
) -> Result<()> {
    let max_key = max_key_size(store.page_size());
    if key.is_empty() || key.len() > max_key {
        return Err(KvError::BadValSize);
    }
    if cfg.leaf2.is_some_and(|w| w != key.len()) {
        return Err(KvError::BadValSize);
    }
    if let Some(dup) = cfg.dup {
        if data.is_empty() || data.len() > max_key {
            return Err(KvError::BadValSize);
        }
        if dup.fixed {
            if db.pad == 0 {
                db.pad = data.len() as u32;
            } else if db.pad as usize != data.len() {
                return Err(KvError::BadValSize);
            }
        }
    }

    if mode.current {
        let Some((cur_key, _)) = current(&*store, st)? else {
            return Err(KvError::Invalid("cursor not positioned"));
        };
        if !(cfg.cmp)(cur_key, key).is_eq() {
            return Err(KvError::Invalid("key does not match the cursor"));
        }
        if cfg.dup.is_some() {
            super::del(store, db, cfg, st, false)?;
            mode.current = false;
        }
    }

    let (mut path, exact) = if mode.current {
        (st.path.clone(), true)
    } else if let Some(root) = db.root {
        locate(&*store, root, cfg, key, &mode)?
    } else {
        let pgno = store.alloc(1)?;
        let flags = match cfg.leaf2 {
            Some(_) => PageFlags::LEAF | PageFlags::LEAF2,
            None => PageFlags::LEAF,
        };
        page::init(store.page_mut(pgno)?, pgno, flags, cfg.leaf2.unwrap_or(0));
        db.root = Some(pgno);
        db.depth = 1;
        db.leaf_pages = 1;
        let mut path = Path::new();
        path.push((pgno, 0));
        (path, false)
    };

    if exact && mode.no_overwrite {
        return Err(KvError::KeyExist);
    }
    if exact && cfg.dup.is_none() && cfg.leaf2.is_none() {
        let (pgno, idx) = path[path.len() - 1];
        let old = page::node(store.page(pgno)?, idx as usize)?.flags();
        if old.contains(NodeFlags::SUBDATA) != mode.node_flags.contains(NodeFlags::SUBDATA) {
            return Err(KvError::Incompatible("value is a database record"));
        }
    }

    touch_path(store, db, &mut path)?;
    if exact {
        if cfg.dup.is_some() {
            dup_put(store, db, cfg, &mut path, key, data, &mode)?;
        } else {
            replace_value(store, db, cfg, &path, key, data, mode.node_flags)?;
        }
    } else {
        let raw = leaf_entry(store, db, cfg, key, data, mode.node_flags)?;
        let (_, idx) = path[path.len() - 1];
        insert_at(store, db, &path, path.len() - 1, idx as usize, &raw)?;
        db.entries += 1;
    }

    let dup_value = cfg.dup.map(|_| data);
    seek_item(&*store, db, cfg, st, key, dup_value)?;
    Ok(())
}

fn locate<S: PageSource + ?Sized>(
    store: &S,
    root: PageId,
    cfg: &TreeCfg,
    key: &[u8],
    mode: &PutMode,
) -> Result<(Path, bool)> {
    if !mode.append {
        return descend(store, root, cfg.cmp, Target::Key(key));
    }
    let (mut path, _) = descend(store, root, cfg.cmp, Target::Last)?;
    let depth = path.len();
    let (pgno, idx) = path[depth - 1];
    let leaf = store.page(pgno)?;
    let n = page::num_keys(leaf);
    if n == 0 {
        return Ok((path, false));
    }
    match (cfg.cmp)(key, page::key_at(leaf, idx as usize)?) {
        std::cmp::Ordering::Greater => {
            path[depth - 1].1 = n as u16;
            Ok((path, false))
        }
        std::cmp::Ordering::Equal if cfg.dup.is_some() && mode.append_dup => Ok((path, true)),
        _ => Err(KvError::KeyExist),
    }
}

/// Makes every page on `path` writable and relinks parents to the copies.
pub(super) fn touch_path<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &mut Path,
) -> Result<()> {
    for level in 0..path.len() {
        let (pgno, _) = path[level];
        let copy = store.touch(pgno)?;
        if copy == pgno {
            continue;
        }
        path[level].0 = copy;
        if level == 0 {
            db.root = Some(copy);
        } else {
            let (parent, pidx) = path[level - 1];
            page::set_child(store.page_mut(parent)?, pidx as usize, copy)?;
        }
    }
    Ok(())
}

/// Encodes a new leaf entry, moving large values to an overflow run.
fn leaf_entry<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    key: &[u8],
    data: &[u8],
    flags: NodeFlags,
) -> Result<Vec<u8>> {
    if cfg.leaf2.is_some() {
        return Ok(key.to_vec());
    }
    let psize = store.page_size();
    if page::leaf_node_size(key.len(), data.len()) <= node_max(psize) || !flags.is_empty() {
        return page::encode_node(key, NodeData::Inline { flags, data });
    }
    let count = page::overflow_count(psize, data.len());
    let pgno = store.alloc(count)?;
    let run = store.page_mut(pgno)?;
    page::init_overflow(run, pgno, count);
    run[PAGE_HDR..PAGE_HDR + data.len()].copy_from_slice(data);
    db.overflow_pages += count as u64;
    trace!(page = pgno.0, pages = count, "btree.overflow_alloc");
    page::encode_node(
        key,
        NodeData::Overflow {
            size: data.len(),
            pgno,
        },
    )
}

fn replace_value<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    path: &Path,
    key: &[u8],
    data: &[u8],
    flags: NodeFlags,
) -> Result<()> {
    let psize = store.page_size();
    let (pgno, idx) = path[path.len() - 1];
    let idx = idx as usize;
    if cfg.leaf2.is_some() {
        return Ok(());
    }
    let (old_len, old_run) = {
        let node = page::node(store.page(pgno)?, idx)?;
        let run = node
            .flags()
            .contains(NodeFlags::BIGDATA)
            .then(|| node.overflow_pgno());
        (node.data().len(), run)
    };
    let big = flags.is_empty() && page::leaf_node_size(key.len(), data.len()) > node_max(psize);

    if let Some(run) = old_run {
        let have = page::overflow_pages(store.page(run)?);
        if big && store.is_dirty(run) && have >= page::overflow_count(psize, data.len()) {
            store.page_mut(run)?[PAGE_HDR..PAGE_HDR + data.len()].copy_from_slice(data);
            return replace_node(
                store,
                db,
                path,
                key,
                NodeData::Overflow {
                    size: data.len(),
                    pgno: run,
                },
            );
        }
        store.free(run, have)?;
        db.overflow_pages = db.overflow_pages.saturating_sub(have as u64);
    } else if !big && old_len == data.len() {
        let page = store.page_mut(pgno)?;
        page::node_data_mut(page, idx)?.copy_from_slice(data);
        page::set_node_flags(page, idx, flags)?;
        return Ok(());
    }

    let raw = leaf_entry(store, db, cfg, key, data, flags)?;
    page::del_node(store.page_mut(pgno)?, idx)?;
    insert_at(store, db, path, path.len() - 1, idx, &raw)
}

/// Rewrites the leaf node under `path` with new data.
pub(super) fn replace_node<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &Path,
    key: &[u8],
    data: NodeData<'_>,
) -> Result<()> {
    let level = path.len() - 1;
    let (pgno, idx) = path[level];
    let raw = page::encode_node(key, data)?;
    page::del_node(store.page_mut(pgno)?, idx as usize)?;
    insert_at(store, db, path, level, idx as usize, &raw)
}

/// Inserts an encoded entry at `idx` of the page at `path[level]`, splitting
/// pages upwards as needed. Upper levels of `path` are stale afterwards if a
/// split happened.
pub(super) fn insert_at<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &Path,
    level: usize,
    idx: usize,
    raw: &[u8],
) -> Result<()> {
    let (pgno, _) = path[level];
    match page::insert_entry(store.page_mut(pgno)?, idx, raw) {
        Err(KvError::PageFull) => split(store, db, path, level, idx, raw),
        other => other,
    }
}

/// Collects every entry of a page in its encoded form.
pub(super) fn entries_of(p: &[u8]) -> Result<Vec<Vec<u8>>> {
    (0..page::num_keys(p))
        .map(|i| page::raw_entry(p, i).map(<[u8]>::to_vec))
        .collect()
}

/// Key of an encoded entry.
pub(super) fn entry_key(raw: &[u8], leaf2: bool) -> &[u8] {
    if leaf2 {
        raw
    } else {
        page::raw_key(raw)
    }
}

/// Whether `entries` fit on one page. Branch pages store their first entry
/// without a key.
pub(super) fn fits(entries: &[Vec<u8>], branch: bool, leaf2: bool, page_size: usize) -> bool {
    let mut total = 0;
    for (i, raw) in entries.iter().enumerate() {
        total += if branch && i == 0 {
            page::node_cost(0, &NodeData::Child(page::raw_child(raw)))
        } else {
            page::entry_cost(raw, leaf2)
        };
    }
    total <= page_size - PAGE_HDR
}

/// Clears `p` and refills it with `entries`.
pub(super) fn rewrite(p: &mut [u8], entries: &[Vec<u8>], branch: bool) -> Result<()> {
    page::clear(p);
    for (i, raw) in entries.iter().enumerate() {
        if branch && i == 0 {
            page::insert_branch(p, 0, &[], page::raw_child(raw))?;
        } else {
            page::insert_entry(p, i, raw)?;
        }
    }
    Ok(())
}

fn choose_split(
    entries: &[Vec<u8>],
    idx: usize,
    branch: bool,
    leaf2: bool,
    page_size: usize,
) -> Result<usize> {
    let total = entries.len();
    let valid = |s: usize| {
        fits(&entries[..s], branch, leaf2, page_size) && fits(&entries[s..], branch, leaf2, page_size)
    };
    // Sequential inserts leave the left page full.
    if idx == total - 1 {
        let s = if branch { total - 2 } else { total - 1 };
        if s >= 1 && valid(s) {
            return Ok(s);
        }
    }
    let costs: Vec<usize> = entries.iter().map(|e| page::entry_cost(e, leaf2)).collect();
    let sum: usize = costs.iter().sum();
    let min_side = if branch && total >= 4 { 2 } else { 1 };
    for min in [min_side, 1] {
        let mut best: Option<(usize, usize)> = None;
        let mut left = 0;
        for s in 1..total {
            left += costs[s - 1];
            if s < min || total - s < min || !valid(s) {
                continue;
            }
            let skew = left.abs_diff(sum - left);
            if best.map_or(true, |(_, b)| skew < b) {
                best = Some((s, skew));
            }
        }
        if let Some((s, _)) = best {
            return Ok(s);
        }
    }
    Err(KvError::Corruption("no valid split point"))
}

fn split<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &Path,
    level: usize,
    idx: usize,
    raw: &[u8],
) -> Result<()> {
    let psize = store.page_size();
    let (pgno, _) = path[level];
    let (flags, pad, mut entries) = {
        let p = store.page(pgno)?;
        (page::flags(p), page::pad(p), entries_of(p)?)
    };
    entries.insert(idx, raw.to_vec());
    let branch = flags.contains(PageFlags::BRANCH);
    let leaf2 = flags.contains(PageFlags::LEAF2);
    let s = choose_split(&entries, idx, branch, leaf2, psize)?;
    let sep = entry_key(&entries[s], leaf2).to_vec();

    let right = store.alloc(1)?;
    let kind = flags & (PageFlags::BRANCH | PageFlags::LEAF | PageFlags::LEAF2);
    page::init(store.page_mut(right)?, right, kind, pad);
    rewrite(store.page_mut(pgno)?, &entries[..s], branch)?;
    rewrite(store.page_mut(right)?, &entries[s..], branch)?;
    if branch {
        db.branch_pages += 1;
    } else {
        db.leaf_pages += 1;
    }
    store.stats().record_split(branch);
    trace!(page = pgno.0, right = right.0, at = s, of = entries.len(), branch, "btree.split");

    if level == 0 {
        let root = store.alloc(1)?;
        let p = store.page_mut(root)?;
        page::init(p, root, PageFlags::BRANCH, 0);
        page::insert_branch(p, 0, &[], pgno)?;
        page::insert_branch(p, 1, &sep, right)?;
        db.root = Some(root);
        db.depth += 1;
        db.branch_pages += 1;
        trace!(root = root.0, depth = db.depth, "btree.root_split");
        return Ok(());
    }
    let (_, pidx) = path[level - 1];
    let sep_raw = page::encode_node(&sep, NodeData::Child(right))?;
    insert_at(store, db, path, level - 1, pidx as usize + 1, &sep_raw)
}
