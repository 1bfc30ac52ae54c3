//! Reader table behavior and its effect on page reuse.

#![allow(missing_docs)]

use sombra_kv::{Database, EnvOptions, Environment, KvError, Result, WriteFlags};
use tempfile::tempdir;

const KEYS: u32 = 200;

fn rewrite_all(env: &Environment, round: u32) -> Result<()> {
    let txn = env.begin_rw()?;
    let value = vec![round as u8; 200];
    for i in 0..KEYS {
        txn.put(Database::MAIN, &i.to_be_bytes(), &value, WriteFlags::empty())?;
    }
    txn.commit()
}

fn last_pgno(env: &Environment) -> Result<u64> {
    Ok(env.info()?.last_pgno)
}

#[test]
fn long_reader_pins_pages_until_released() -> Result<()> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        map_size: 64 << 20,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    rewrite_all(&env, 0)?;

    let pinned = env.begin_ro()?;
    let listed = env.reader_list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].pid, std::process::id());
    assert_eq!(listed[0].txnid, Some(pinned.id()));

    let start = last_pgno(&env)?;
    for round in 1..=30 {
        rewrite_all(&env, round)?;
    }
    let grown = last_pgno(&env)? - start;
    assert!(grown > 100, "only {grown} pages added while a reader was pinned");
    let value = pinned.get(Database::MAIN, &42u32.to_be_bytes())?.expect("pinned value");
    assert!(value.iter().all(|&b| b == 0));
    drop(pinned);
    assert!(env.reader_list().is_empty());

    for round in 31..=36 {
        rewrite_all(&env, round)?;
    }
    let settled = last_pgno(&env)?;
    for round in 37..=80 {
        rewrite_all(&env, round)?;
    }
    let after = last_pgno(&env)?;
    assert!(
        after <= settled + 16,
        "file kept growing without readers: {settled} -> {after}"
    );
    Ok(())
}

#[test]
fn reader_table_has_a_fixed_size() -> Result<()> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        max_readers: 2,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    assert_eq!(env.max_readers(), 2);
    let a = env.begin_ro()?;
    let b = env.begin_ro()?;
    assert!(matches!(env.begin_ro(), Err(KvError::ReadersFull)));
    assert_eq!(env.info()?.num_readers, 2);
    drop(a);
    let c = env.begin_ro()?;
    assert_eq!(c.id(), b.id());
    Ok(())
}

#[test]
fn committed_reader_releases_its_slot() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let ro = env.begin_ro()?;
    assert_eq!(env.reader_list().len(), 1);
    ro.commit()?;
    assert!(env.reader_list().is_empty());
    Ok(())
}

#[cfg(unix)]
#[test]
fn stale_reader_of_a_dead_process_is_cleared() -> Result<()> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::FileExt;
    use std::process::Command;

    const HEADER: u64 = 64;
    const SLOT: u64 = 32;

    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    rewrite_all(&env, 0)?;

    let mut child = Command::new("true").spawn().expect("spawn child");
    let dead_pid = child.id();
    child.wait().expect("child exit");

    // Two readers grow the table to two slots; the second is then released.
    let keep = env.begin_ro()?;
    drop(env.begin_ro()?);
    {
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .open(env.lock_path())
            .expect("open lock file");
        let slot = HEADER + SLOT;
        lock.write_at(&0u64.to_ne_bytes(), slot).expect("write txnid");
        lock.write_at(&dead_pid.to_ne_bytes(), slot + 8).expect("write pid");
    }

    let readers = env.reader_list();
    assert!(readers.iter().any(|r| r.pid == dead_pid && r.txnid == Some(0)));
    assert_eq!(env.reader_check()?, 1);
    let readers = env.reader_list();
    assert_eq!(readers.len(), 1);
    assert_eq!(readers[0].pid, std::process::id());
    assert_eq!(env.reader_check()?, 0);
    drop(keep);

    rewrite_all(&env, 1)?;
    Ok(())
}
