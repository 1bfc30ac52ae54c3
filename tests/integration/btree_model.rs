//! Model-based checks of the tree engine through transactions.
//!
//! Random operation sequences run against both an environment and a
//! `BTreeMap`; after every commit or abort the two must hold the same items
//! in the same order, forwards and backwards.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sombra_kv::{Database, DbFlags, EnvOptions, Environment, KvError, Result, WriteFlags};
use tempfile::tempdir;

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn small_pages() -> EnvOptions {
    EnvOptions {
        page_size: 512,
        map_size: 64 << 20,
        ..EnvOptions::default()
    }
}

fn snapshot(env: &Environment, db: Database) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let ro = env.begin_ro()?;
    let mut cur = ro.cursor(db)?;
    cur.iter()
        .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect()
}

fn snapshot_backwards(env: &Environment, db: Database) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let ro = env.begin_ro()?;
    let mut cur = ro.cursor(db)?;
    let mut out = Vec::new();
    let mut item = cur.last()?;
    while let Some((k, v)) = item {
        out.push((k.to_vec(), v.to_vec()));
        item = cur.prev()?;
    }
    out.reverse();
    Ok(out)
}

fn assert_matches(env: &Environment, db: Database, model: &Model) -> Result<()> {
    let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(snapshot(env, db)?, expected);
    assert_eq!(snapshot_backwards(env, db)?, expected);
    assert_eq!(env.begin_ro()?.stat(db)?.entries, model.len() as u64);
    Ok(())
}

#[derive(Clone, Debug)]
enum Op {
    Put(u16, usize),
    Del(u16),
    Commit,
    Abort,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u16..600, 0usize..700).prop_map(|(k, len)| Op::Put(k, len)),
        3 => (0u16..600).prop_map(Op::Del),
        1 => Just(Op::Commit),
        1 => Just(Op::Abort),
    ]
}

fn key_of(k: u16) -> Vec<u8> {
    format!("k{k:05}").into_bytes()
}

fn value_of(k: u16, len: usize) -> Vec<u8> {
    (0..len).map(|i| (k as usize + i) as u8).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn transactions_match_a_btreemap(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let dir = tempdir().unwrap();
        let env = Environment::open(dir.path(), small_pages()).unwrap();
        let mut committed = Model::new();
        let mut pending = committed.clone();
        let mut txn = Some(env.begin_rw().unwrap());

        for op in ops {
            let w = txn.get_or_insert_with(|| env.begin_rw().unwrap());
            match op {
                Op::Put(k, len) => {
                    let (key, value) = (key_of(k), value_of(k, len.max(1)));
                    w.put(Database::MAIN, &key, &value, WriteFlags::empty()).unwrap();
                    pending.insert(key, value);
                }
                Op::Del(k) => {
                    let key = key_of(k);
                    let res = w.del(Database::MAIN, &key, None);
                    prop_assert_eq!(res.is_ok(), pending.remove(&key).is_some());
                }
                Op::Commit => {
                    txn.take().unwrap().commit().unwrap();
                    committed = pending.clone();
                    assert_matches(&env, Database::MAIN, &committed).unwrap();
                }
                Op::Abort => {
                    txn.take().unwrap().abort();
                    pending = committed.clone();
                    assert_matches(&env, Database::MAIN, &committed).unwrap();
                }
            }
        }
        if let Some(w) = txn.take() {
            w.commit().unwrap();
            committed = pending;
        }
        assert_matches(&env, Database::MAIN, &committed).unwrap();
    }
}

#[test]
fn seeded_workload_keeps_order_and_space_bounded() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), small_pages())?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_cafe);
    let mut model = Model::new();

    for _round in 0..40 {
        let txn = env.begin_rw()?;
        for _ in 0..150 {
            let key = rng.gen::<u32>() % 4_000;
            let key = key.to_be_bytes().to_vec();
            if rng.gen_bool(0.3) {
                if model.remove(&key).is_some() {
                    txn.del(Database::MAIN, &key, None)?;
                }
            } else {
                let len = rng.gen_range(1..1_200);
                let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                txn.put(Database::MAIN, &key, &value, WriteFlags::empty())?;
                model.insert(key, value);
            }
        }
        txn.commit()?;
    }
    assert_matches(&env, Database::MAIN, &model)?;

    let ro = env.begin_ro()?;
    let mut cur = ro.cursor(Database::MAIN)?;
    for probe in [0u32, 17, 1_999, 3_999, 4_000] {
        let probe = probe.to_be_bytes();
        let expected = model.range(probe.to_vec()..).next().map(|(k, _)| k.clone());
        let got = cur.set_range(&probe)?.map(|(k, _)| k.to_vec());
        assert_eq!(got, expected);
    }
    drop(cur);
    drop(ro);

    let txn = env.begin_rw()?;
    for key in model.keys() {
        txn.del(Database::MAIN, key, None)?;
    }
    txn.commit()?;
    let stat = env.stat()?;
    assert_eq!(stat.entries, 0);
    assert_eq!(stat.depth, 0);
    assert_eq!(stat.leaf_pages + stat.branch_pages + stat.overflow_pages, 0);
    Ok(())
}

#[test]
fn append_mode_builds_the_same_tree() -> Result<()> {
    let dir = tempdir().unwrap();
    let env = Environment::open(dir.path(), small_pages())?;
    let txn = env.begin_rw()?;
    for i in 0..3_000u32 {
        txn.put(Database::MAIN, &i.to_be_bytes(), &i.to_le_bytes(), WriteFlags::APPEND)?;
    }
    assert!(matches!(
        txn.put(Database::MAIN, &5u32.to_be_bytes(), b"late", WriteFlags::APPEND),
        Err(KvError::KeyExist)
    ));
    txn.commit()?;
    let ro = env.begin_ro()?;
    assert_eq!(ro.stat(Database::MAIN)?.entries, 3_000);
    assert_eq!(ro.get(Database::MAIN, &1_234u32.to_be_bytes())?, Some(&1_234u32.to_le_bytes()[..]));
    Ok(())
}

#[test]
fn integer_key_database_orders_numerically() -> Result<()> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        max_dbs: 1,
        ..small_pages()
    };
    let env = Environment::open(dir.path(), opts)?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut expected: Vec<u64> = (0..1_000).map(|_| rng.gen::<u64>() >> 8).collect();
    let txn = env.begin_rw()?;
    let db = txn.open_db(Some("ints"), DbFlags::CREATE | DbFlags::INTEGER_KEY)?;
    for n in &expected {
        txn.put(db, &n.to_ne_bytes(), b"", WriteFlags::empty())?;
    }
    txn.commit()?;
    expected.sort_unstable();
    expected.dedup();

    let ro = env.begin_ro()?;
    let db = ro.open_db(Some("ints"), DbFlags::empty())?;
    let mut cur = ro.cursor(db)?;
    let mut seen = Vec::new();
    for item in cur.iter() {
        let (k, _) = item?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(k);
        seen.push(u64::from_ne_bytes(raw));
    }
    assert_eq!(seen, expected);
    Ok(())
}
