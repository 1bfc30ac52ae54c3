//! Write transactions larger than the dirty page budget, and nested
//! transactions on top of spilled state.

#![allow(missing_docs)]

use std::sync::Once;

use sombra_kv::{Database, EnvOptions, Environment, Result, RwTxn, WriteFlags};
use tempfile::{tempdir, TempDir};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_kv=warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn open_small_budget() -> Result<(TempDir, Environment)> {
    init_tracing();
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        map_size: 64 << 20,
        max_dirty_pages: 64,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    Ok((dir, env))
}

fn key(prefix: &str, i: u32) -> Vec<u8> {
    format!("{prefix}-{i:06}").into_bytes()
}

fn value(i: u32) -> Vec<u8> {
    let mut v = vec![(i % 251) as u8; 120];
    v[..4].copy_from_slice(&i.to_le_bytes());
    v
}

fn fill(txn: &RwTxn, prefix: &str, count: u32) -> Result<()> {
    for i in 0..count {
        txn.put(Database::MAIN, &key(prefix, i), &value(i), WriteFlags::empty())?;
    }
    Ok(())
}

fn count_prefix(env: &Environment, prefix: &str) -> Result<usize> {
    let ro = env.begin_ro()?;
    let mut cur = ro.cursor(Database::MAIN)?;
    let mut n = 0;
    let mut item = cur.set_range(prefix.as_bytes())?;
    while let Some((k, _)) = item {
        if !k.starts_with(prefix.as_bytes()) {
            break;
        }
        n += 1;
        item = cur.next()?;
    }
    Ok(n)
}

#[test]
fn large_write_spills_and_commits_everything() -> Result<()> {
    let (_dir, env) = open_small_budget()?;
    let before = env.btree_stats().spilled_pages;
    let txn = env.begin_rw()?;
    fill(&txn, "big", 5_000)?;
    assert!(env.btree_stats().spilled_pages > before);

    assert_eq!(txn.get(Database::MAIN, &key("big", 17))?, Some(value(17)));
    assert_eq!(txn.stat(Database::MAIN)?.entries, 5_000);
    {
        let mut cur = txn.cursor(Database::MAIN)?;
        let mut seen = 0;
        let mut item = cur.first()?;
        while let Some((k, v)) = item {
            assert_eq!(k, key("big", seen));
            assert_eq!(v, value(seen));
            seen += 1;
            item = cur.next()?;
        }
        assert_eq!(seen, 5_000);
    }
    for i in (0..5_000).step_by(3) {
        txn.put(Database::MAIN, &key("big", i), b"rewritten", WriteFlags::empty())?;
    }
    txn.commit()?;

    let ro = env.begin_ro()?;
    assert_eq!(ro.stat(Database::MAIN)?.entries, 5_000);
    assert_eq!(ro.get(Database::MAIN, &key("big", 3))?, Some(&b"rewritten"[..]));
    assert_eq!(ro.get(Database::MAIN, &key("big", 4))?, Some(value(4).as_slice()));
    Ok(())
}

#[test]
fn abort_after_spill_leaves_the_last_commit() -> Result<()> {
    let (_dir, env) = open_small_budget()?;
    let txn = env.begin_rw()?;
    fill(&txn, "base", 200)?;
    txn.commit()?;

    let before = env.btree_stats().spilled_pages;
    let txn = env.begin_rw()?;
    fill(&txn, "gone", 4_000)?;
    for i in 0..200 {
        txn.del(Database::MAIN, &key("base", i), None)?;
    }
    assert!(env.btree_stats().spilled_pages > before);
    txn.abort();

    assert_eq!(count_prefix(&env, "base")?, 200);
    assert_eq!(count_prefix(&env, "gone")?, 0);

    let txn = env.begin_rw()?;
    fill(&txn, "next", 3_000)?;
    txn.commit()?;
    assert_eq!(count_prefix(&env, "base")?, 200);
    assert_eq!(count_prefix(&env, "next")?, 3_000);
    Ok(())
}

#[test]
fn nested_abort_after_spill_keeps_the_parent() -> Result<()> {
    let (_dir, env) = open_small_budget()?;
    let mut txn = env.begin_rw()?;
    fill(&txn, "parent", 600)?;
    {
        let child = txn.nested()?;
        fill(&child, "child", 4_000)?;
        for i in 0..600 {
            child.del(Database::MAIN, &key("parent", i), None)?;
        }
        assert_eq!(child.stat(Database::MAIN)?.entries, 4_000);
        child.abort();
    }
    assert_eq!(txn.stat(Database::MAIN)?.entries, 600);
    assert_eq!(txn.get(Database::MAIN, &key("parent", 599))?, Some(value(599)));
    assert!(txn.get(Database::MAIN, &key("child", 0))?.is_none());
    txn.commit()?;

    assert_eq!(count_prefix(&env, "parent")?, 600);
    assert_eq!(count_prefix(&env, "child")?, 0);
    Ok(())
}

#[test]
fn nested_commit_after_spill_reaches_the_file() -> Result<()> {
    let (_dir, env) = open_small_budget()?;
    let mut txn = env.begin_rw()?;
    fill(&txn, "parent", 300)?;
    {
        let child = txn.nested()?;
        fill(&child, "child", 3_000)?;
        child.del(Database::MAIN, &key("parent", 0), None)?;
        child.commit()?;
    }
    fill(&txn, "after", 10)?;
    txn.commit()?;

    assert_eq!(count_prefix(&env, "parent")?, 299);
    assert_eq!(count_prefix(&env, "child")?, 3_000);
    assert_eq!(count_prefix(&env, "after")?, 10);
    Ok(())
}

#[test]
fn grandchild_commit_is_undone_by_its_parent_abort() -> Result<()> {
    let (_dir, env) = open_small_budget()?;
    let mut txn = env.begin_rw()?;
    txn.put(Database::MAIN, b"root", b"1", WriteFlags::empty())?;
    {
        let mut child = txn.nested()?;
        child.put(Database::MAIN, b"child", b"2", WriteFlags::empty())?;
        {
            let grandchild = child.nested()?;
            grandchild.put(Database::MAIN, b"grandchild", b"3", WriteFlags::empty())?;
            grandchild.put(Database::MAIN, b"root", b"overwritten", WriteFlags::empty())?;
            grandchild.commit()?;
        }
        assert_eq!(child.get(Database::MAIN, b"grandchild")?, Some(b"3".to_vec()));
        assert_eq!(child.get(Database::MAIN, b"root")?, Some(b"overwritten".to_vec()));
        child.abort();
    }
    {
        let mut child = txn.nested()?;
        child.put(Database::MAIN, b"kept", b"4", WriteFlags::empty())?;
        {
            let grandchild = child.nested()?;
            grandchild.put(Database::MAIN, b"dropped", b"5", WriteFlags::empty())?;
        }
        child.commit()?;
    }
    txn.commit()?;

    let ro = env.begin_ro()?;
    assert_eq!(ro.get(Database::MAIN, b"root")?, Some(&b"1"[..]));
    assert_eq!(ro.get(Database::MAIN, b"kept")?, Some(&b"4"[..]));
    for gone in [&b"child"[..], b"grandchild", b"dropped"] {
        assert!(ro.get(Database::MAIN, gone)?.is_none());
    }
    assert_eq!(ro.stat(Database::MAIN)?.entries, 2);
    Ok(())
}
