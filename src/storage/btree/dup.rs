//! Sorted duplicates. A key with one value is a plain node; more values
//! live in an inline sub-page until the node would outgrow `node_max`, after
//! which they move to a sub-tree whose record is stored in the node.

use tracing::debug;

use super::del::{del, rebalance};
use super::put::{put, replace_node, PutMode};
use super::{node_max, CursorState, DbRecord, DupPos, PageStore, Path, TreeCfg};
use crate::primitives::pager::page::{self, Node, NodeData, NodeFlags};
use crate::types::{KvError, Result};

/// The values stored under one key.
#[derive(Clone, Copy, Debug)]
pub enum DupSet<'a> {
    /// A single value stored directly in the node.
    Single(&'a [u8]),
    /// An inline sub-page.
    Inline(&'a [u8]),
    /// A sub-tree.
    Tree(DbRecord),
}

impl<'a> DupSet<'a> {
    /// Interprets a leaf node of a duplicate-sorted tree.
    pub fn of(node: &Node<'a>) -> Result<Self> {
        let flags = node.flags();
        if flags.contains(NodeFlags::BIGDATA) {
            return Err(KvError::Corruption("overflow value in duplicate database"));
        }
        if !flags.contains(NodeFlags::DUPDATA) {
            return Ok(DupSet::Single(node.data()));
        }
        if flags.contains(NodeFlags::SUBDATA) {
            return Ok(DupSet::Tree(DbRecord::decode(node.data())?));
        }
        page::validate(node.data())?;
        Ok(DupSet::Inline(node.data()))
    }

    /// Number of values.
    pub fn len(&self) -> Result<u64> {
        Ok(match self {
            DupSet::Single(_) => 1,
            DupSet::Inline(sp) => page::num_keys(sp) as u64,
            DupSet::Tree(rec) => rec.entries,
        })
    }
}

enum Existing {
    Values(Vec<Vec<u8>>),
    Tree(DbRecord),
}

fn existing<S: PageStore + ?Sized>(store: &S, path: &Path) -> Result<(Vec<u8>, Existing)> {
    let (pgno, idx) = path[path.len() - 1];
    let node = page::node(store.page(pgno)?, idx as usize)?;
    let set = match DupSet::of(&node)? {
        DupSet::Single(v) => Existing::Values(vec![v.to_vec()]),
        DupSet::Inline(sp) => Existing::Values(
            (0..page::num_keys(sp))
                .map(|i| page::key_at(sp, i).map(<[u8]>::to_vec))
                .collect::<Result<_>>()?,
        ),
        DupSet::Tree(rec) => Existing::Tree(rec),
    };
    Ok((node.key().to_vec(), set))
}

/// Adds `value` to the duplicates of the key under `path`, which must be
/// writable.
pub(super) fn dup_put<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    path: &mut Path,
    key: &[u8],
    value: &[u8],
    mode: &PutMode,
) -> Result<()> {
    let dup = cfg.dup.ok_or(KvError::Invalid("database is not dup-sorted"))?;
    let sub_cfg = cfg
        .sub_tree(db)
        .ok_or(KvError::Invalid("database is not dup-sorted"))?;
    let (_, set) = existing(&*store, path)?;
    match set {
        Existing::Values(mut values) => {
            let pos = match values.binary_search_by(|v| (dup.cmp)(v, value)) {
                Ok(_) if mode.no_dup_data || mode.append_dup => return Err(KvError::KeyExist),
                Ok(_) => return Ok(()),
                Err(pos) => pos,
            };
            if mode.append_dup && pos != values.len() {
                return Err(KvError::KeyExist);
            }
            values.insert(pos, value.to_vec());
            let refs: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
            let fixed = dup.fixed.then_some(db.pad as usize);
            let size = page::subpage_size(&refs, fixed);
            if page::leaf_node_size(key.len(), size) <= node_max(store.page_size()) {
                let sp = page::build_subpage(&refs, fixed)?;
                let data = NodeData::Inline {
                    flags: NodeFlags::DUPDATA,
                    data: &sp,
                };
                replace_node(store, db, path, key, data)?;
            } else {
                let mut rec = DbRecord::empty(0);
                if dup.fixed {
                    rec.pad = db.pad;
                }
                let mut scratch = CursorState::default();
                let append = PutMode {
                    append: true,
                    ..PutMode::default()
                };
                for v in &refs {
                    put(store, &mut rec, &sub_cfg, &mut scratch, v, &[], append)?;
                }
                let encoded = rec.encode();
                let data = NodeData::Inline {
                    flags: NodeFlags::DUPDATA | NodeFlags::SUBDATA,
                    data: &encoded,
                };
                replace_node(store, db, path, key, data)?;
                store.stats().record_dup_promotion();
                debug!(values = refs.len(), root = ?rec.root, "btree.dup_promote");
            }
        }
        Existing::Tree(mut rec) => {
            let mut scratch = CursorState::default();
            let sub_mode = PutMode {
                no_overwrite: true,
                append: mode.append_dup,
                ..PutMode::default()
            };
            if let Err(err) = put(store, &mut rec, &sub_cfg, &mut scratch, value, &[], sub_mode) {
                return match err {
                    KvError::KeyExist if !mode.no_dup_data && !mode.append_dup => Ok(()),
                    other => Err(other),
                };
            }
            let (pgno, idx) = path[path.len() - 1];
            page::node_data_mut(store.page_mut(pgno)?, idx as usize)?.copy_from_slice(&rec.encode());
        }
    }
    db.entries += 1;
    Ok(())
}

/// Removes the duplicate at `pos` from the key under `path`, which must be
/// writable. The key disappears with its last value.
pub(super) fn dup_del_one<S: PageStore + ?Sized>(
    store: &mut S,
    db: &mut DbRecord,
    cfg: &TreeCfg,
    path: &mut Path,
    pos: Option<DupPos>,
) -> Result<()> {
    let dup = cfg.dup.ok_or(KvError::Invalid("database is not dup-sorted"))?;
    let sub_cfg = cfg
        .sub_tree(db)
        .ok_or(KvError::Invalid("database is not dup-sorted"))?;
    let (key, set) = existing(&*store, path)?;
    match (set, pos) {
        (Existing::Values(mut values), Some(DupPos::Inline(i))) if (i as usize) < values.len() => {
            values.remove(i as usize);
            if let [only] = values.as_slice() {
                let data = NodeData::Inline {
                    flags: NodeFlags::empty(),
                    data: only,
                };
                replace_node(store, db, path, &key, data)?;
            } else {
                let refs: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
                let sp = page::build_subpage(&refs, dup.fixed.then_some(db.pad as usize))?;
                let data = NodeData::Inline {
                    flags: NodeFlags::DUPDATA,
                    data: &sp,
                };
                replace_node(store, db, path, &key, data)?;
            }
            db.entries -= 1;
            rebalance(store, db, path)
        }
        (Existing::Tree(mut rec), Some(DupPos::Tree(sub_path))) => {
            let mut sub = CursorState {
                path: sub_path,
                initialized: true,
                ..CursorState::default()
            };
            del(store, &mut rec, &sub_cfg, &mut sub, false)?;
            db.entries -= 1;
            let (pgno, idx) = path[path.len() - 1];
            if rec.entries == 0 {
                page::del_node(store.page_mut(pgno)?, idx as usize)?;
                rebalance(store, db, path)
            } else {
                page::node_data_mut(store.page_mut(pgno)?, idx as usize)?
                    .copy_from_slice(&rec.encode());
                Ok(())
            }
        }
        _ => Err(KvError::Corruption("cursor is not on a duplicate")),
    }
}
