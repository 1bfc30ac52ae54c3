//! Recovery from damaged meta pages.
//!
//! Each commit writes the meta slot `txnid % 2`, so damaging the slot of the
//! newest commit must bring the environment back at the commit before it.

#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use sombra_kv::{Database, EnvOptions, Environment, KvError, Result, Synchronous, WriteFlags};
use tempfile::tempdir;

const PAGE_SIZE: u64 = 4096;

fn scribble(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open data file");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("write");
    file.sync_all().expect("sync");
}

fn put_one(env: &Environment, key: &[u8], value: &[u8]) -> Result<()> {
    let txn = env.begin_rw()?;
    txn.put(Database::MAIN, key, value, WriteFlags::empty())?;
    txn.commit()
}

#[test]
fn damaged_newest_meta_falls_back_one_commit() -> Result<()> {
    let dir = tempdir().unwrap();
    let data_path = {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        let txn = env.begin_rw()?;
        for i in 0..500u32 {
            txn.put(Database::MAIN, &i.to_be_bytes(), b"first", WriteFlags::empty())?;
        }
        txn.commit()?;
        let txn = env.begin_rw()?;
        for i in 0..500u32 {
            txn.put(Database::MAIN, &i.to_be_bytes(), b"second", WriteFlags::empty())?;
        }
        txn.put(Database::MAIN, b"only-in-two", b"x", WriteFlags::empty())?;
        txn.commit()?;
        assert_eq!(env.info()?.last_txnid, 2);
        env.data_path().to_path_buf()
    };

    // Commit 2 lives in slot 0; damage its database records.
    scribble(&data_path, 48, &[0xff; 8]);

    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 1);
    assert_eq!(ro.get(Database::MAIN, &7u32.to_be_bytes())?, Some(&b"first"[..]));
    assert!(ro.get(Database::MAIN, b"only-in-two")?.is_none());
    assert_eq!(ro.stat(Database::MAIN)?.entries, 500);
    Ok(())
}

#[test]
fn commit_after_recovery_overwrites_the_damaged_slot() -> Result<()> {
    let dir = tempdir().unwrap();
    let data_path = {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        put_one(&env, b"a", b"1")?;
        put_one(&env, b"b", b"2")?;
        env.data_path().to_path_buf()
    };
    scribble(&data_path, 16, &[0; 4]);

    {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        assert_eq!(env.info()?.last_txnid, 1);
        put_one(&env, b"c", b"3")?;
        assert_eq!(env.info()?.last_txnid, 2);
    }

    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 2);
    assert_eq!(ro.get(Database::MAIN, b"a")?, Some(&b"1"[..]));
    assert!(ro.get(Database::MAIN, b"b")?.is_none());
    assert_eq!(ro.get(Database::MAIN, b"c")?, Some(&b"3"[..]));
    Ok(())
}

#[test]
fn damaged_older_meta_is_ignored() -> Result<()> {
    let dir = tempdir().unwrap();
    let data_path = {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        put_one(&env, b"a", b"1")?;
        put_one(&env, b"b", b"2")?;
        env.data_path().to_path_buf()
    };
    // Slot 1 still holds commit 1.
    scribble(&data_path, PAGE_SIZE + 40, &[0xaa; 16]);

    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 2);
    assert_eq!(ro.get(Database::MAIN, b"b")?, Some(&b"2"[..]));
    drop(ro);
    put_one(&env, b"c", b"3")?;
    assert_eq!(env.info()?.last_txnid, 3);
    Ok(())
}

#[test]
fn both_metas_damaged_is_corruption() -> Result<()> {
    let dir = tempdir().unwrap();
    let data_path = {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        put_one(&env, b"a", b"1")?;
        env.data_path().to_path_buf()
    };
    scribble(&data_path, 16, &[0; 4]);
    scribble(&data_path, PAGE_SIZE + 16, &[0; 4]);

    let err = Environment::open(dir.path(), EnvOptions::default())
        .err()
        .expect("open must fail");
    assert!(matches!(err, KvError::Corruption(_)), "unexpected error: {err}");
    Ok(())
}

#[test]
fn every_sync_mode_survives_a_clean_close() -> Result<()> {
    for mode in [Synchronous::Full, Synchronous::Normal, Synchronous::Off] {
        let dir = tempdir().unwrap();
        let opts = EnvOptions {
            synchronous: mode,
            ..EnvOptions::default()
        };
        {
            let env = Environment::open(dir.path(), opts.clone())?;
            for i in 0..20u32 {
                put_one(&env, &i.to_be_bytes(), format!("{mode:?}").as_bytes())?;
            }
            env.sync(true)?;
        }
        let env = Environment::open(dir.path(), opts)?;
        let ro = env.begin_ro()?;
        assert_eq!(ro.id(), 20);
        assert_eq!(ro.stat(Database::MAIN)?.entries, 20);
        assert_eq!(
            ro.get(Database::MAIN, &19u32.to_be_bytes())?,
            Some(format!("{mode:?}").as_bytes())
        );
    }
    Ok(())
}

#[test]
fn existing_file_keeps_its_page_size() -> Result<()> {
    let dir = tempdir().unwrap();
    {
        let opts = EnvOptions {
            page_size: 1024,
            ..EnvOptions::default()
        };
        let env = Environment::open(dir.path(), opts)?;
        put_one(&env, b"k", b"v")?;
    }
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    assert_eq!(env.page_size(), 1024);
    assert_eq!(env.begin_ro()?.get(Database::MAIN, b"k")?, Some(&b"v"[..]));
    Ok(())
}
