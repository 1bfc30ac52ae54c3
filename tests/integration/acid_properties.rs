//! Transaction guarantees seen through the public API.
//!
//! - Committed data is durable across reopen.
//! - Aborted or failed transactions leave no trace.
//! - Readers see one consistent snapshot while the writer keeps committing.
//! - Writers are serialized, so read-modify-write never loses an update.
//! - A write transaction that only reads leaves the file untouched.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::fs;
use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;

use sombra_kv::{Database, EnvOptions, Environment, KvError, Result, WriteFlags};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const ACCOUNTS: u32 = 16;
const START_BALANCE: u64 = 1_000;

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

fn account(i: u32) -> Vec<u8> {
    format!("acct-{i:03}").into_bytes()
}

fn balance(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    u64::from_le_bytes(buf)
}

fn seed_accounts(env: &Environment) -> Result<()> {
    let txn = env.begin_rw()?;
    for i in 0..ACCOUNTS {
        txn.put(
            Database::MAIN,
            &account(i),
            &START_BALANCE.to_le_bytes(),
            WriteFlags::empty(),
        )?;
    }
    txn.commit()
}

#[test]
fn committed_data_survives_reopen() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        seed_accounts(&env)?;
        let txn = env.begin_rw()?;
        txn.put(Database::MAIN, b"note", b"persisted", WriteFlags::empty())?;
        txn.commit()?;
    }
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 2);
    assert_eq!(ro.get(Database::MAIN, b"note")?, Some(&b"persisted"[..]));
    assert_eq!(ro.stat(Database::MAIN)?.entries, u64::from(ACCOUNTS) + 1);
    Ok(())
}

#[test]
fn dropped_write_txn_is_rolled_back() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    seed_accounts(&env)?;
    {
        let txn = env.begin_rw()?;
        for i in 0..ACCOUNTS {
            txn.put(Database::MAIN, &account(i), &0u64.to_le_bytes(), WriteFlags::empty())?;
        }
    }
    let ro = env.begin_ro()?;
    for i in 0..ACCOUNTS {
        let raw = ro.get(Database::MAIN, &account(i))?.expect("account");
        assert_eq!(balance(raw), START_BALANCE);
    }
    assert_eq!(env.info()?.last_txnid, 1);
    Ok(())
}

#[test]
fn map_full_poisons_the_txn_and_keeps_the_last_commit() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        map_size: 32 * 4096,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    seed_accounts(&env)?;

    let txn = env.begin_rw()?;
    let value = vec![0xabu8; 3000];
    let mut failure = None;
    for i in 0..1_000u32 {
        if let Err(err) = txn.put(Database::MAIN, &i.to_be_bytes(), &value, WriteFlags::empty()) {
            failure = Some(err);
            break;
        }
    }
    assert!(matches!(failure, Some(KvError::MapFull)));
    assert!(matches!(
        txn.put(Database::MAIN, b"late", b"x", WriteFlags::empty()),
        Err(KvError::BadTxn)
    ));
    assert!(matches!(txn.commit(), Err(KvError::BadTxn)));

    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 1);
    assert_eq!(ro.stat(Database::MAIN)?.entries, u64::from(ACCOUNTS));
    drop(ro);

    let txn = env.begin_rw()?;
    txn.put(Database::MAIN, b"after", b"ok", WriteFlags::empty())?;
    txn.commit()?;
    assert_eq!(env.begin_ro()?.get(Database::MAIN, b"after")?, Some(&b"ok"[..]));
    Ok(())
}

#[test]
fn readers_always_see_a_consistent_total() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    seed_accounts(&env)?;
    let expected = START_BALANCE * u64::from(ACCOUNTS);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || -> Result<usize> {
                let mut snapshots = 0;
                while !stop.load(Ordering::Acquire) {
                    let ro = env.begin_ro()?;
                    let mut cur = ro.cursor(Database::MAIN)?;
                    let mut total = 0;
                    for item in cur.iter() {
                        let (_, value) = item?;
                        total += balance(value);
                    }
                    assert_eq!(total, expected, "snapshot {} is torn", ro.id());
                    snapshots += 1;
                }
                Ok(snapshots)
            })
        })
        .collect();

    for round in 0..200u32 {
        let from = account(round % ACCOUNTS);
        let to = account((round * 7 + 3) % ACCOUNTS);
        let txn = env.begin_rw()?;
        let a = balance(&txn.get(Database::MAIN, &from)?.expect("from"));
        let b = balance(&txn.get(Database::MAIN, &to)?.expect("to"));
        let amount = u64::from(round % 5);
        if from != to && a >= amount {
            txn.put(Database::MAIN, &from, &(a - amount).to_le_bytes(), WriteFlags::empty())?;
            txn.put(Database::MAIN, &to, &(b + amount).to_le_bytes(), WriteFlags::empty())?;
        }
        txn.commit()?;
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().expect("reader thread")?;
    }
    Ok(())
}

#[test]
fn writers_are_serialized() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let env = env.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..50 {
                    let txn = env.begin_rw()?;
                    let current = txn
                        .get(Database::MAIN, b"counter")?
                        .map(|raw| balance(&raw))
                        .unwrap_or(0);
                    txn.put(
                        Database::MAIN,
                        b"counter",
                        &(current + 1).to_le_bytes(),
                        WriteFlags::empty(),
                    )?;
                    txn.commit()?;
                }
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("writer thread")?;
    }
    let ro = env.begin_ro()?;
    let raw = ro.get(Database::MAIN, b"counter")?.expect("counter");
    assert_eq!(balance(raw), 200);
    assert_eq!(ro.id(), 200);
    Ok(())
}

#[test]
fn second_writer_waits_for_the_first() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    let txn = env.begin_rw()?;
    txn.put(Database::MAIN, b"first", b"1", WriteFlags::empty())?;

    let started = Arc::new(AtomicBool::new(false));
    let waiter = {
        let env = env.clone();
        let started = Arc::clone(&started);
        thread::spawn(move || -> Result<()> {
            let txn = env.begin_rw()?;
            started.store(true, Ordering::SeqCst);
            assert_eq!(txn.get(Database::MAIN, b"first")?, Some(b"1".to_vec()));
            txn.put(Database::MAIN, b"second", b"2", WriteFlags::empty())?;
            txn.commit()
        })
    };
    thread::sleep(Duration::from_millis(200));
    assert!(!started.load(Ordering::SeqCst), "second writer began early");
    txn.commit()?;
    waiter.join().expect("writer thread")?;
    assert!(started.load(Ordering::SeqCst));

    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 2);
    assert_eq!(ro.get(Database::MAIN, b"second")?, Some(&b"2"[..]));
    Ok(())
}

#[test]
fn aborting_a_read_only_write_txn_keeps_the_file_identical() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), EnvOptions::default())?;
    seed_accounts(&env)?;
    let data = dir.path().join("data.mdb");
    let before = fs::read(&data).unwrap();

    let txn = env.begin_rw()?;
    assert!(txn.get(Database::MAIN, &account(3))?.is_some());
    let mut cur = txn.cursor(Database::MAIN)?;
    let mut seen = 0;
    while cur.next()?.is_some() {
        seen += 1;
    }
    assert_eq!(seen, ACCOUNTS);
    drop(cur);
    txn.abort();
    drop(env.begin_rw()?);

    assert_eq!(fs::read(&data).unwrap(), before);
    let ro = env.begin_ro()?;
    assert_eq!(ro.id(), 1);
    Ok(())
}

#[test]
fn read_only_environment_refuses_writes() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    {
        let env = Environment::open(dir.path(), EnvOptions::default())?;
        seed_accounts(&env)?;
    }
    let opts = EnvOptions {
        read_only: true,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    assert!(matches!(env.begin_rw(), Err(KvError::Invalid(_))));
    let ro = env.begin_ro()?;
    assert_eq!(ro.stat(Database::MAIN)?.entries, u64::from(ACCOUNTS));
    Ok(())
}
