//! Read-side navigation: descending to a key, stepping between leaves, and
//! moving within duplicate sets. Everything here works on a
//! [`CursorState`] and any [`PageSource`].

use super::dup::DupSet;
use super::{push, CompareFn, CursorState, DbRecord, DupPos, Path, PageSource, TreeCfg};
use crate::primitives::pager::page::{self, Node, NodeFlags};
use crate::types::{KvError, PageId, Result};

/// A key and one of its values.
pub type Item<'a> = (&'a [u8], &'a [u8]);

/// Where [`descend`] should go.
#[derive(Clone, Copy, Debug)]
pub enum Target<'k> {
    /// Leftmost leaf entry.
    First,
    /// Rightmost leaf entry.
    Last,
    /// First entry not less than the key.
    Key(&'k [u8]),
}

/// Walks from `root` to a leaf. Returns the path and, for [`Target::Key`],
/// whether the leaf entry matches exactly. The leaf index may equal the
/// number of entries when the key sorts after everything on that leaf.
pub fn descend<S: PageSource + ?Sized>(
    src: &S,
    root: PageId,
    cmp: CompareFn,
    target: Target<'_>,
) -> Result<(Path, bool)> {
    let mut path = Path::new();
    let mut pgno = root;
    loop {
        let p = src.page(pgno)?;
        page::validate(p)?;
        let n = page::num_keys(p);
        if page::is_branch(p) {
            if n == 0 {
                return Err(KvError::Corruption("empty branch page"));
            }
            let idx = match target {
                Target::First => 0,
                Target::Last => n - 1,
                Target::Key(key) => {
                    let (i, exact) = page::search(p, key, cmp)?;
                    if exact {
                        i
                    } else {
                        i - 1
                    }
                }
            };
            push(&mut path, pgno, idx)?;
            pgno = page::node(p, idx)?.child();
        } else {
            let (idx, exact) = match target {
                Target::First => (0, false),
                Target::Last => (n.saturating_sub(1), false),
                Target::Key(key) => page::search(p, key, cmp)?,
            };
            push(&mut path, pgno, idx)?;
            return Ok((path, exact));
        }
    }
}

/// Moves the leaf position of `path` to the neighbouring leaf. Returns
/// `false` when there is no leaf in that direction; `path` is unchanged then.
pub(crate) fn step_leaf<S: PageSource + ?Sized>(
    src: &S,
    path: &mut Path,
    forward: bool,
) -> Result<bool> {
    let depth = path.len();
    let mut level = depth - 1;
    loop {
        if level == 0 {
            return Ok(false);
        }
        level -= 1;
        let (pgno, idx) = path[level];
        let n = page::num_keys(src.page(pgno)?);
        if forward && (idx as usize) + 1 < n {
            path[level].1 = idx + 1;
            break;
        }
        if !forward && idx > 0 {
            path[level].1 = idx - 1;
            break;
        }
    }
    for l in level..depth - 1 {
        let (pgno, idx) = path[l];
        let child = page::node(src.page(pgno)?, idx as usize)?.child();
        let n = page::num_keys(src.page(child)?);
        let cidx = if forward { 0 } else { n.saturating_sub(1) };
        path[l + 1] = (child, cidx as u16);
    }
    Ok(true)
}

/// Steps the leaf position one entry, crossing leaves as needed.
fn step_entry<S: PageSource + ?Sized>(src: &S, path: &mut Path, forward: bool) -> Result<bool> {
    let depth = path.len();
    let (pgno, idx) = path[depth - 1];
    if forward {
        let n = page::num_keys(src.page(pgno)?);
        if (idx as usize) + 1 < n {
            path[depth - 1].1 = idx + 1;
            return Ok(true);
        }
    } else if idx > 0 {
        path[depth - 1].1 = idx - 1;
        return Ok(true);
    }
    step_leaf(src, path, forward)
}

/// Moves a leaf index that sits past the end of its page onto the first
/// entry of the next leaf. Returns `false` if there is none.
fn settle<S: PageSource + ?Sized>(src: &S, path: &mut Path) -> Result<bool> {
    let depth = path.len();
    let (pgno, idx) = path[depth - 1];
    let n = page::num_keys(src.page(pgno)?);
    if (idx as usize) < n {
        return Ok(true);
    }
    if step_leaf(src, path, true)? {
        return Ok(true);
    }
    path[depth - 1].1 = n.saturating_sub(1) as u16;
    Ok(false)
}

fn leaf_node<'s, S: PageSource + ?Sized>(src: &'s S, path: &Path) -> Result<Node<'s>> {
    let (pgno, idx) = *path
        .last()
        .ok_or(KvError::Invalid("cursor not positioned"))?;
    page::node(src.page(pgno)?, idx as usize)
}

/// Resolves the value of a leaf node, following overflow pages.
pub(crate) fn node_value<'s, S: PageSource + ?Sized>(src: &'s S, node: &Node<'s>) -> Result<&'s [u8]> {
    if node.flags().contains(NodeFlags::BIGDATA) {
        let run = src.run(node.overflow_pgno())?;
        let size = node.data_size();
        if page::PAGE_HDR + size > run.len() {
            return Err(KvError::Corruption("overflow value exceeds its run"));
        }
        Ok(&run[page::PAGE_HDR..page::PAGE_HDR + size])
    } else {
        Ok(node.data())
    }
}

fn init_dup<S: PageSource + ?Sized>(
    src: &S,
    cfg: &TreeCfg,
    st: &mut CursorState,
    last: bool,
) -> Result<()> {
    st.dup = None;
    let Some(dup) = cfg.dup else {
        return Ok(());
    };
    let node = leaf_node(src, &st.path)?;
    match DupSet::of(&node)? {
        DupSet::Single(_) => {}
        DupSet::Inline(sp) => {
            let n = page::num_keys(sp);
            if n == 0 {
                return Err(KvError::Corruption("empty duplicate sub-page"));
            }
            st.dup = Some(DupPos::Inline(if last { n - 1 } else { 0 } as u16));
        }
        DupSet::Tree(rec) => {
            let root = rec
                .root
                .ok_or(KvError::Corruption("empty duplicate sub-tree"))?;
            let target = if last { Target::Last } else { Target::First };
            let (path, _) = descend(src, root, dup.cmp, target)?;
            st.dup = Some(DupPos::Tree(path));
        }
    }
    Ok(())
}

fn step_dup<S: PageSource + ?Sized>(src: &S, st: &mut CursorState, forward: bool) -> Result<bool> {
    match &mut st.dup {
        None => Ok(false),
        Some(DupPos::Inline(i)) => {
            let node = leaf_node(src, &st.path)?;
            let n = page::num_keys(node.data());
            if forward && (*i as usize) + 1 < n {
                *i += 1;
                Ok(true)
            } else if !forward && *i > 0 {
                *i -= 1;
                Ok(true)
            } else {
                Ok(false)
            }
        }
        Some(DupPos::Tree(path)) => step_entry(src, path, forward),
    }
}

/// The item under the cursor.
pub fn current<'s, S: PageSource + ?Sized>(src: &'s S, st: &CursorState) -> Result<Option<Item<'s>>> {
    if !st.on_item() {
        return Ok(None);
    }
    let node = leaf_node(src, &st.path)?;
    let value = match &st.dup {
        None => node_value(src, &node)?,
        Some(DupPos::Inline(i)) => page::key_at(node.data(), *i as usize)?,
        Some(DupPos::Tree(path)) => {
            let (pgno, idx) = *path
                .last()
                .ok_or(KvError::Corruption("empty duplicate path"))?;
            page::key_at(src.page(pgno)?, idx as usize)?
        }
    };
    Ok(Some((node.key(), value)))
}

/// Node flags of the item under the cursor.
pub fn current_flags<S: PageSource + ?Sized>(src: &S, st: &CursorState) -> Result<NodeFlags> {
    if !st.on_item() {
        return Err(KvError::Invalid("cursor not positioned"));
    }
    Ok(leaf_node(src, &st.path)?.flags())
}

/// Positions at the first item.
pub fn first<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    edge(src, db, cfg, st, false)
}

/// Positions at the last item.
pub fn last<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    edge(src, db, cfg, st, true)
}

fn edge<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    last: bool,
) -> Result<Option<Item<'s>>> {
    st.reset();
    let Some(root) = db.root else {
        return Ok(None);
    };
    let target = if last { Target::Last } else { Target::First };
    let (path, _) = descend(src, root, cfg.cmp, target)?;
    let (leaf, _) = path[path.len() - 1];
    if page::num_keys(src.page(leaf)?) == 0 {
        return Ok(None);
    }
    st.path = path;
    st.initialized = true;
    init_dup(src, cfg, st, last)?;
    current(src, st)
}

fn next_key<'s, S: PageSource + ?Sized>(
    src: &'s S,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !step_entry(src, &mut st.path, true)? {
        st.eof = true;
        return Ok(None);
    }
    init_dup(src, cfg, st, false)?;
    current(src, st)
}

fn prev_key<'s, S: PageSource + ?Sized>(
    src: &'s S,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !step_entry(src, &mut st.path, false)? {
        return Ok(None);
    }
    init_dup(src, cfg, st, true)?;
    current(src, st)
}

/// Moves to the next item, including the next duplicate of the same key.
pub fn next<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.initialized {
        return first(src, db, cfg, st);
    }
    if st.eof {
        return Ok(None);
    }
    if st.after_delete {
        st.after_delete = false;
        st.delete_moved_key = false;
        return current(src, st);
    }
    if step_dup(src, st, true)? {
        return current(src, st);
    }
    next_key(src, cfg, st)
}

/// Moves to the previous item, including the previous duplicate.
pub fn prev<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.initialized {
        return last(src, db, cfg, st);
    }
    st.after_delete = false;
    st.delete_moved_key = false;
    if st.eof {
        st.eof = false;
        return current(src, st);
    }
    if step_dup(src, st, false)? {
        return current(src, st);
    }
    prev_key(src, cfg, st)
}

/// Moves to the first value of the next key.
pub fn next_nodup<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.initialized {
        return first(src, db, cfg, st);
    }
    if st.eof {
        return Ok(None);
    }
    if st.after_delete {
        let moved = st.delete_moved_key;
        st.after_delete = false;
        st.delete_moved_key = false;
        if moved {
            return current(src, st);
        }
    }
    next_key(src, cfg, st)
}

/// Moves to the last value of the previous key.
pub fn prev_nodup<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.initialized {
        return last(src, db, cfg, st);
    }
    st.after_delete = false;
    st.delete_moved_key = false;
    if st.eof {
        st.eof = false;
        init_dup(src, cfg, st, true)?;
        return current(src, st);
    }
    prev_key(src, cfg, st)
}

/// Moves to the next value of the current key only.
pub fn next_dup<'s, S: PageSource + ?Sized>(src: &'s S, st: &mut CursorState) -> Result<Option<Item<'s>>> {
    if !st.on_item() {
        return Ok(None);
    }
    if st.after_delete {
        if st.delete_moved_key {
            return Ok(None);
        }
        st.after_delete = false;
        return current(src, st);
    }
    if step_dup(src, st, true)? {
        return current(src, st);
    }
    Ok(None)
}

/// Moves to the previous value of the current key only.
pub fn prev_dup<'s, S: PageSource + ?Sized>(src: &'s S, st: &mut CursorState) -> Result<Option<Item<'s>>> {
    if !st.on_item() {
        return Ok(None);
    }
    st.after_delete = false;
    st.delete_moved_key = false;
    if step_dup(src, st, false)? {
        return current(src, st);
    }
    Ok(None)
}

/// Moves to the first value of the current key.
pub fn first_dup<'s, S: PageSource + ?Sized>(
    src: &'s S,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.on_item() {
        return Ok(None);
    }
    st.after_delete = false;
    st.delete_moved_key = false;
    init_dup(src, cfg, st, false)?;
    current(src, st)
}

/// Moves to the last value of the current key.
pub fn last_dup<'s, S: PageSource + ?Sized>(
    src: &'s S,
    cfg: &TreeCfg,
    st: &mut CursorState,
) -> Result<Option<Item<'s>>> {
    if !st.on_item() {
        return Ok(None);
    }
    st.after_delete = false;
    st.delete_moved_key = false;
    init_dup(src, cfg, st, true)?;
    current(src, st)
}

/// Positions at `key` exactly.
pub fn set<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
) -> Result<Option<Item<'s>>> {
    st.reset();
    let Some(root) = db.root else {
        return Ok(None);
    };
    let (path, exact) = descend(src, root, cfg.cmp, Target::Key(key))?;
    if !exact {
        return Ok(None);
    }
    st.path = path;
    st.initialized = true;
    init_dup(src, cfg, st, false)?;
    current(src, st)
}

/// Positions at the first key not less than `key`.
pub fn set_range<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
) -> Result<Option<Item<'s>>> {
    st.reset();
    let Some(root) = db.root else {
        return Ok(None);
    };
    let (path, _) = descend(src, root, cfg.cmp, Target::Key(key))?;
    st.path = path;
    if !settle(src, &mut st.path)? {
        st.reset();
        return Ok(None);
    }
    st.initialized = true;
    init_dup(src, cfg, st, false)?;
    current(src, st)
}

/// Moves within the duplicates of the current key to `value`, or with
/// `exact == false` to the first value not less than it.
fn dup_seek<S: PageSource + ?Sized>(
    src: &S,
    cfg: &TreeCfg,
    st: &mut CursorState,
    value: &[u8],
    exact: bool,
) -> Result<bool> {
    let Some(dup) = cfg.dup else {
        let (_, v) = current(src, st)?.ok_or(KvError::Invalid("cursor not positioned"))?;
        return Ok(if exact {
            v == value
        } else {
            v >= value
        });
    };
    let node = leaf_node(src, &st.path)?;
    match DupSet::of(&node)? {
        DupSet::Single(v) => {
            let ord = (dup.cmp)(v, value);
            Ok(if exact {
                ord.is_eq()
            } else {
                ord.is_ge()
            })
        }
        DupSet::Inline(sp) => {
            let (i, found) = page::search(sp, value, dup.cmp)?;
            if (exact && !found) || i >= page::num_keys(sp) {
                return Ok(false);
            }
            st.dup = Some(DupPos::Inline(i as u16));
            Ok(true)
        }
        DupSet::Tree(rec) => {
            let root = rec
                .root
                .ok_or(KvError::Corruption("empty duplicate sub-tree"))?;
            let (mut path, found) = descend(src, root, dup.cmp, Target::Key(value))?;
            if exact && !found {
                return Ok(false);
            }
            if !settle(src, &mut path)? {
                return Ok(false);
            }
            st.dup = Some(DupPos::Tree(path));
            Ok(true)
        }
    }
}

/// Positions at the exact key/value pair.
pub fn get_both<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
    value: &[u8],
) -> Result<Option<Item<'s>>> {
    if set(src, db, cfg, st, key)?.is_none() {
        return Ok(None);
    }
    if !dup_seek(src, cfg, st, value, true)? {
        st.reset();
        return Ok(None);
    }
    current(src, st)
}

/// Positions at `key` and its first value not less than `value`.
pub fn get_both_range<'s, S: PageSource + ?Sized>(
    src: &'s S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
    value: &[u8],
) -> Result<Option<Item<'s>>> {
    if set(src, db, cfg, st, key)?.is_none() {
        return Ok(None);
    }
    if !dup_seek(src, cfg, st, value, false)? {
        st.reset();
        return Ok(None);
    }
    current(src, st)
}

/// Number of values stored under the current key.
pub fn count<S: PageSource + ?Sized>(src: &S, cfg: &TreeCfg, st: &CursorState) -> Result<u64> {
    if !st.on_item() {
        return Err(KvError::Invalid("cursor not positioned"));
    }
    if cfg.dup.is_none() {
        return Ok(1);
    }
    let node = leaf_node(src, &st.path)?;
    DupSet::of(&node)?.len()
}

/// Repositions the cursor on `key` (and `value` for duplicate databases)
/// or, when that item is gone, on the item that follows it. Returns whether
/// the exact item was found. Used to restore cursors after the tree changed.
pub fn seek_item<S: PageSource + ?Sized>(
    src: &S,
    db: &DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<bool> {
    st.reset();
    let Some(root) = db.root else {
        return Ok(false);
    };
    let (path, exact) = descend(src, root, cfg.cmp, Target::Key(key))?;
    st.path = path;
    st.initialized = true;
    if !exact {
        if !settle(src, &mut st.path)? {
            st.eof = true;
            init_dup(src, cfg, st, true)?;
            return Ok(false);
        }
        init_dup(src, cfg, st, false)?;
        return Ok(false);
    }
    init_dup(src, cfg, st, false)?;
    let (Some(value), Some(dup)) = (value, cfg.dup) else {
        return Ok(true);
    };
    if dup_seek(src, cfg, st, value, false)? {
        let found = match current(src, st)? {
            Some((_, v)) => (dup.cmp)(v, value).is_eq(),
            None => false,
        };
        return Ok(found);
    }
    init_dup(src, cfg, st, true)?;
    next_key(src, cfg, st)?;
    if st.eof {
        init_dup(src, cfg, st, true)?;
    }
    Ok(false)
}
