//! Hot backups: page-for-page copies and compacting rebuilds.

#![allow(missing_docs)]

use std::fs;

use sombra_kv::{Database, DbFlags, EnvOptions, Environment, KvError, Result, WriteFlags};
use tempfile::tempdir;

fn options() -> EnvOptions {
    EnvOptions {
        max_dbs: 4,
        map_size: 32 << 20,
        ..EnvOptions::default()
    }
}

fn items(env: &Environment, name: Option<&str>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let ro = env.begin_ro()?;
    let db = match name {
        Some(_) => ro.open_db(name, DbFlags::empty())?,
        None => Database::MAIN,
    };
    let mut cur = ro.cursor(db)?;
    cur.iter()
        .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect()
}

fn populate(env: &Environment) -> Result<()> {
    let txn = env.begin_rw()?;
    let docs = txn.open_db(Some("docs"), DbFlags::CREATE)?;
    let tags = txn.open_db(Some("tags"), DbFlags::CREATE | DbFlags::DUP_SORT)?;
    for i in 0..2_000u32 {
        let key = format!("doc-{i:05}");
        txn.put(docs, key.as_bytes(), &vec![b'd'; 300], WriteFlags::empty())?;
        txn.put(tags, format!("t{}", i % 7).as_bytes(), &i.to_be_bytes(), WriteFlags::empty())?;
        if i % 10 == 0 {
            txn.put(Database::MAIN, &i.to_be_bytes(), key.as_bytes(), WriteFlags::empty())?;
        }
    }
    txn.commit()?;

    let txn = env.begin_rw()?;
    let docs = txn.open_db(Some("docs"), DbFlags::empty())?;
    for i in 0..2_000u32 {
        if i % 20 != 0 {
            txn.del(docs, format!("doc-{i:05}").as_bytes(), None)?;
        }
    }
    txn.commit()
}

#[test]
fn plain_copy_matches_the_source() -> Result<()> {
    let src_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();
    let env = Environment::open(src_dir.path(), options())?;
    populate(&env)?;
    let backup = dst_dir.path().join("backup");
    env.copy(&backup, false)?;

    let copy = Environment::open(&backup, options())?;
    assert_eq!(copy.info()?.last_txnid, env.info()?.last_txnid);
    assert_eq!(copy.info()?.last_pgno, env.info()?.last_pgno);
    for name in [None, Some("docs"), Some("tags")] {
        assert_eq!(items(&copy, name)?, items(&env, name)?);
    }
    Ok(())
}

#[test]
fn compact_copy_drops_free_pages() -> Result<()> {
    let src_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();
    let env = Environment::open(src_dir.path(), options())?;
    populate(&env)?;

    let plain = dst_dir.path().join("plain");
    let compact = dst_dir.path().join("compact");
    env.copy(&plain, false)?;
    env.copy(&compact, true)?;
    assert!(!compact.join("lock.mdb").exists());

    let plain_len = fs::metadata(plain.join("data.mdb"))?.len();
    let compact_len = fs::metadata(compact.join("data.mdb"))?.len();
    assert!(
        compact_len < plain_len,
        "compact copy is {compact_len} bytes, plain copy {plain_len}"
    );

    let copy = Environment::open(&compact, options())?;
    for name in [None, Some("docs"), Some("tags")] {
        assert_eq!(items(&copy, name)?, items(&env, name)?);
    }
    let ro = copy.begin_ro()?;
    let tags = ro.open_db(Some("tags"), DbFlags::empty())?;
    assert!(ro.db_flags(tags)?.contains(DbFlags::DUP_SORT));
    let mut cur = ro.cursor(tags)?;
    cur.set(b"t3")?;
    assert_eq!(cur.count()?, 286);
    Ok(())
}

#[test]
fn copy_ignores_uncommitted_writes() -> Result<()> {
    let src_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();
    let env = Environment::open(src_dir.path(), options())?;
    let txn = env.begin_rw()?;
    txn.put(Database::MAIN, b"committed", b"yes", WriteFlags::empty())?;
    txn.commit()?;

    let pending = env.begin_rw()?;
    pending.put(Database::MAIN, b"pending", b"no", WriteFlags::empty())?;
    let backup = dst_dir.path().join("backup");
    env.copy(&backup, true)?;
    pending.commit()?;

    let copy = Environment::open(&backup, options())?;
    let ro = copy.begin_ro()?;
    assert_eq!(ro.get(Database::MAIN, b"committed")?, Some(&b"yes"[..]));
    assert!(ro.get(Database::MAIN, b"pending")?.is_none());
    Ok(())
}

#[test]
fn copy_refuses_an_existing_destination() -> Result<()> {
    let src_dir = tempdir().unwrap();
    let dst_dir = tempdir().unwrap();
    let env = Environment::open(src_dir.path(), options())?;
    let backup = dst_dir.path().join("backup");
    env.copy(&backup, false)?;
    assert!(matches!(env.copy(&backup, false), Err(KvError::Invalid(_))));
    assert!(matches!(env.copy(&backup, true), Err(KvError::Invalid(_))));
    Ok(())
}

#[test]
fn single_file_layout_copies_to_a_file() -> Result<()> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        no_sub_dir: true,
        ..options()
    };
    let env = Environment::open(dir.path().join("store.db"), opts.clone())?;
    assert!(dir.path().join("store.db-lock").exists());
    let txn = env.begin_rw()?;
    for i in 0..100u32 {
        txn.put(Database::MAIN, &i.to_be_bytes(), b"v", WriteFlags::empty())?;
    }
    txn.commit()?;

    let target = dir.path().join("store-copy.db");
    env.copy(&target, true)?;
    assert!(target.is_file());
    assert!(!dir.path().join("store-copy.db-lock").exists());
    let copy = Environment::open(&target, opts)?;
    assert_eq!(items(&copy, None)?, items(&env, None)?);
    Ok(())
}
