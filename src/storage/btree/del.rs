use tracing::{trace, warn};

use super::cursor::{current, seek_item};
use super::dup::{dup_del_one, DupSet};
use super::put::{entries_of, entry_key, fits, insert_at, rewrite, touch_path};
use super::{CursorState, DbRecord, PageStore, Path, TreeCfg, FILL_THRESHOLD};
use crate::primitives::pager::page::{self, NodeData, NodeFlags};
use crate::types::{KvError, PageId, Result};

/// Deletes the item under the cursor, or every value of its key when
/// `all_dups` is set. The cursor is left on the item that followed.
pub fn del<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    st: &mut CursorState,
    all_dups: bool,
) -> Result<()> {
    if !st.on_item() || st.after_delete {
        return Err(KvError::NotFound);
    }
    let (pgno, idx) = st.path[st.path.len() - 1];
    let key = page::key_at(store.page(pgno)?, idx as usize)?.to_vec();
    let value = match (cfg.dup, all_dups) {
        (Some(_), false) => current(&*store, st)?.map(|(_, v)| v.to_vec()),
        _ => None,
    };

    let mut path = st.path.clone();
    touch_path(store, db, &mut path)?;
    let (pgno, idx) = path[path.len() - 1];
    let idx = idx as usize;
    let flags = if cfg.leaf2.is_some() {
        NodeFlags::empty()
    } else {
        page::node(store.page(pgno)?, idx)?.flags()
    };

    if cfg.dup.is_some() && flags.contains(NodeFlags::DUPDATA) && !all_dups {
        dup_del_one(store, db, cfg, &mut path, st.dup.clone())?;
    } else {
        let removed = release_payload(store, db, cfg, pgno, idx, flags)?;
        page::del_node(store.page_mut(pgno)?, idx)?;
        db.entries = db.entries.saturating_sub(removed);
        rebalance(store, db, &mut path)?;
    }

    seek_item(&*store, db, cfg, st, &key, value.as_deref())?;
    if st.on_item() {
        st.after_delete = true;
        let (pgno, idx) = st.path[st.path.len() - 1];
        let now = page::key_at(store.page(pgno)?, idx as usize)?;
        st.delete_moved_key = !(cfg.cmp)(now, &key).is_eq();
    }
    Ok(())
}

/// Frees whatever a leaf node owns outside its page and returns the number
/// of items it held.
fn release_payload<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    pgno: PageId,
    idx: usize,
    flags: NodeFlags,
) -> Result<u64> {
    if cfg.leaf2.is_some() {
        return Ok(1);
    }
    if flags.contains(NodeFlags::BIGDATA) {
        let run = page::node(store.page(pgno)?, idx)?.overflow_pgno();
        let count = page::overflow_pages(store.page(run)?);
        store.free(run, count)?;
        db.overflow_pages = db.overflow_pages.saturating_sub(count as u64);
        return Ok(1);
    }
    if cfg.dup.is_none() || !flags.contains(NodeFlags::DUPDATA) {
        return Ok(1);
    }
    let set = {
        let node = page::node(store.page(pgno)?, idx)?;
        match DupSet::of(&node)? {
            DupSet::Tree(rec) => Ok(rec),
            other => Err(other.len()?),
        }
    };
    match set {
        Ok(rec) => {
            free_tree(store, &rec)?;
            Ok(rec.entries)
        }
        Err(n) => Ok(n),
    }
}

/// Frees every page of a tree, including overflow runs and duplicate
/// sub-trees hanging off its leaves.
pub fn free_tree<S: PageStore + ?Sized>(store: &mut S, rec: &DbRecord) -> Result<()> {
    let Some(root) = rec.root else {
        return Ok(());
    };
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let mut runs = Vec::new();
        let mut subs = Vec::new();
        {
            let p = store.page(pgno)?;
            page::validate(p)?;
            let n = page::num_keys(p);
            if page::is_branch(p) {
                for i in 0..n {
                    stack.push(page::node(p, i)?.child());
                }
            } else if !page::is_leaf2(p) {
                for i in 0..n {
                    let node = page::node(p, i)?;
                    let flags = node.flags();
                    if flags.contains(NodeFlags::BIGDATA) {
                        runs.push(node.overflow_pgno());
                    } else if flags.contains(NodeFlags::DUPDATA | NodeFlags::SUBDATA) {
                        subs.push(DbRecord::decode(node.data())?);
                    }
                }
            }
        }
        for run in runs {
            let count = page::overflow_pages(store.page(run)?);
            store.free(run, count)?;
        }
        for sub in subs {
            free_tree(store, &sub)?;
        }
        store.free(pgno, 1)?;
    }
    Ok(())
}

fn min_keys(branch: bool) -> usize {
    if branch {
        2
    } else {
        1
    }
}

/// Restores fill and key-count minimums of the page at the end of `path`
/// after a removal, moving a node from a sibling or merging with it.
pub(super) fn rebalance<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &mut Path,
) -> Result<()> {
    let level = path.len() - 1;
    let (pgno, _) = path[level];
    let (n, fill, branch) = {
        let p = store.page(pgno)?;
        (page::num_keys(p), page::fill_permille(p), page::is_branch(p))
    };
    if fill >= FILL_THRESHOLD && n >= min_keys(branch) {
        return Ok(());
    }

    if level == 0 {
        if !branch && n == 0 {
            store.free(pgno, 1)?;
            db.root = None;
            db.depth = 0;
            db.leaf_pages = db.leaf_pages.saturating_sub(1);
            trace!(page = pgno.0, "btree.root_emptied");
        } else if branch && n == 1 {
            let child = page::node(store.page(pgno)?, 0)?.child();
            store.free(pgno, 1)?;
            db.root = Some(child);
            db.depth -= 1;
            db.branch_pages = db.branch_pages.saturating_sub(1);
            path.remove(0);
            trace!(old = pgno.0, root = child.0, "btree.root_collapse");
        }
        return Ok(());
    }

    let (parent, my_idx) = path[level - 1];
    let my_idx = my_idx as usize;
    let parent_n = page::num_keys(store.page(parent)?);
    if parent_n < 2 {
        return Ok(());
    }
    let (sib_idx, sib_on_right) = if my_idx == 0 {
        (1, true)
    } else {
        (my_idx - 1, false)
    };
    let sib_old = page::node(store.page(parent)?, sib_idx)?.child();
    let sib = store.touch(sib_old)?;
    if sib != sib_old {
        page::set_child(store.page_mut(parent)?, sib_idx, sib)?;
    }
    let (left, right, right_idx) = if sib_on_right {
        (pgno, sib, sib_idx)
    } else {
        (sib, pgno, my_idx)
    };

    let (sn, sfill) = {
        let p = store.page(sib)?;
        (page::num_keys(p), page::fill_permille(p))
    };
    let rich = sn > min_keys(branch);
    let tried_move = sfill >= FILL_THRESHOLD && rich;
    if tried_move && move_node(store, db, path, level, left, right, right_idx, sib_on_right)? {
        store.stats().record_node_move();
        return Ok(());
    }
    if merge(store, db, path, level, left, right, right_idx)? {
        return Ok(());
    }
    // The pair does not fit one page; take a node from the sibling instead.
    if !tried_move
        && rich
        && move_node(store, db, path, level, left, right, right_idx, sib_on_right)?
    {
        store.stats().record_node_move();
        return Ok(());
    }
    if n < min_keys(branch) {
        warn!(page = pgno.0, keys = n, sibling_keys = sn, "btree.rebalance_stuck");
        return Err(KvError::PageFull);
    }
    Ok(())
}

/// Entries of `pgno` with the real key restored on a branch page's first
/// node, taken from the parent separator `sep`.
fn keyed_entries<S: PageStore + ?Sized>(
    store: &S,
    pgno: PageId,
    sep: Option<&[u8]>,
) -> Result<(Vec<Vec<u8>>, bool, bool)> {
    let p = store.page(pgno)?;
    let branch = page::is_branch(p);
    let leaf2 = page::is_leaf2(p);
    let mut entries = entries_of(p)?;
    if let (true, Some(sep), Some(first)) = (branch, sep, entries.first_mut()) {
        *first = page::encode_node(sep, NodeData::Child(page::raw_child(first)))?;
    }
    Ok((entries, branch, leaf2))
}

#[allow(clippy::too_many_arguments)]
fn move_node<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &Path,
    level: usize,
    left: PageId,
    right: PageId,
    right_idx: usize,
    from_right: bool,
) -> Result<bool> {
    let psize = store.page_size();
    let (parent, _) = path[level - 1];
    let sep = page::key_at(store.page(parent)?, right_idx)?.to_vec();
    let (mut lefts, branch, leaf2) = keyed_entries(&*store, left, None)?;
    let (mut rights, _, _) = keyed_entries(&*store, right, Some(&sep))?;
    if from_right {
        let moved = rights.remove(0);
        lefts.push(moved);
    } else {
        let Some(moved) = lefts.pop() else {
            return Ok(false);
        };
        rights.insert(0, moved);
    }
    if lefts.is_empty()
        || rights.is_empty()
        || !fits(&lefts, branch, leaf2, psize)
        || !fits(&rights, branch, leaf2, psize)
    {
        return Ok(false);
    }
    rewrite(store.page_mut(left)?, &lefts, branch)?;
    rewrite(store.page_mut(right)?, &rights, branch)?;
    let new_sep = entry_key(&rights[0], leaf2).to_vec();
    trace!(left = left.0, right = right.0, from_right, "btree.move_node");
    update_separator(store, db, path, level - 1, right_idx, &new_sep, right)?;
    Ok(true)
}

fn merge<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &mut Path,
    level: usize,
    left: PageId,
    right: PageId,
    right_idx: usize,
) -> Result<bool> {
    let psize = store.page_size();
    let (parent, _) = path[level - 1];
    let sep = page::key_at(store.page(parent)?, right_idx)?.to_vec();
    let (mut combined, branch, leaf2) = keyed_entries(&*store, left, None)?;
    let (rights, _, _) = keyed_entries(&*store, right, Some(&sep))?;
    combined.extend(rights);
    if !fits(&combined, branch, leaf2, psize) {
        return Ok(false);
    }
    rewrite(store.page_mut(left)?, &combined, branch)?;
    page::del_node(store.page_mut(parent)?, right_idx)?;
    store.free(right, 1)?;
    if branch {
        db.branch_pages = db.branch_pages.saturating_sub(1);
    } else {
        db.leaf_pages = db.leaf_pages.saturating_sub(1);
    }
    store.stats().record_merge();
    trace!(left = left.0, right = right.0, branch, "btree.merge");
    path.truncate(level);
    path[level - 1].1 = right_idx.saturating_sub(1) as u16;
    rebalance(store, db, path)?;
    Ok(true)
}

fn update_separator<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    path: &Path,
    level: usize,
    idx: usize,
    key: &[u8],
    child: PageId,
) -> Result<()> {
    if idx == 0 {
        return Ok(());
    }
    let (parent, _) = path[level];
    page::del_node(store.page_mut(parent)?, idx)?;
    let raw = page::encode_node(key, NodeData::Child(child))?;
    insert_at(store, db, path, level, idx, &raw)
}
