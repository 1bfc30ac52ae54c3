//! Duplicate-sorted databases: inline sets, promotion to sub-trees, fixed
//! size values and the alternate value orderings.

#![allow(missing_docs)]

use sombra_kv::{
    Database, DbFlags, EnvOptions, Environment, KvError, Result, RoTxn, WriteFlags,
};
use tempfile::{tempdir, TempDir};

fn open() -> Result<(TempDir, Environment)> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        max_dbs: 4,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts)?;
    Ok((dir, env))
}

fn create(env: &Environment, name: &str, flags: DbFlags) -> Result<Database> {
    let txn = env.begin_rw()?;
    let db = txn.open_db(Some(name), flags | DbFlags::CREATE)?;
    txn.commit()?;
    Ok(db)
}

fn values_of(txn: &RoTxn, db: Database, key: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut cur = txn.cursor(db)?;
    let mut out = Vec::new();
    let mut item = cur.set(key)?;
    while let Some((_, v)) = item {
        out.push(v.to_vec());
        item = cur.next_dup()?;
    }
    Ok(out)
}

#[test]
fn large_sets_move_to_a_sub_tree() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "tags", DbFlags::DUP_SORT)?;
    let before = env.btree_stats().dup_promotions;

    let txn = env.begin_rw()?;
    txn.put(db, b"a", b"solo", WriteFlags::empty())?;
    for i in (0..600u32).rev() {
        txn.put(db, b"m", &i.to_be_bytes(), WriteFlags::empty())?;
    }
    txn.put(db, b"z", b"tail", WriteFlags::empty())?;
    txn.commit()?;
    assert!(env.btree_stats().dup_promotions > before);

    let ro = env.begin_ro()?;
    assert_eq!(ro.stat(db)?.entries, 602);
    let values = values_of(&ro, db, b"m")?;
    let expected: Vec<Vec<u8>> = (0..600u32).map(|i| i.to_be_bytes().to_vec()).collect();
    assert_eq!(values, expected);

    let mut cur = ro.cursor(db)?;
    cur.set(b"m")?;
    assert_eq!(cur.count()?, 600);
    let (k, v) = cur.last_dup()?.expect("last dup");
    assert_eq!((k, v), (&b"m"[..], &599u32.to_be_bytes()[..]));
    let (_, v) = cur.prev_dup()?.expect("prev dup");
    assert_eq!(v, &598u32.to_be_bytes()[..]);
    let (k, _) = cur.next_nodup()?.expect("next key");
    assert_eq!(k, b"z");
    let (k, v) = cur.prev_nodup()?.expect("back to m");
    assert_eq!(k, b"m");
    assert_eq!(v, &599u32.to_be_bytes()[..]);

    let (_, v) = cur
        .get_both_range(b"m", &[0, 0, 1, 0x80])?
        .expect("range inside the set");
    assert_eq!(v, &0x180u32.to_be_bytes()[..]);
    assert!(cur.get_both(b"m", &600u32.to_be_bytes())?.is_none());
    Ok(())
}

#[test]
fn deleting_through_a_cursor_shrinks_the_set() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "tags", DbFlags::DUP_SORT)?;
    let txn = env.begin_rw()?;
    for i in 0..400u32 {
        txn.put(db, b"k", &i.to_be_bytes(), WriteFlags::empty())?;
    }
    txn.put(db, b"l", b"next", WriteFlags::empty())?;
    {
        let mut cur = txn.cursor(db)?;
        let mut item = cur.first()?;
        let mut index = 0u32;
        while let Some((k, _)) = item {
            if k != b"k" {
                break;
            }
            if index % 2 == 0 {
                cur.del(false)?;
            }
            item = cur.next()?;
            index += 1;
        }
        assert_eq!(index, 400);
    }
    txn.commit()?;

    let ro = env.begin_ro()?;
    let values = values_of(&ro, db, b"k")?;
    assert_eq!(values.len(), 200);
    assert!(values
        .iter()
        .zip((1..400u32).step_by(2))
        .all(|(v, i)| v.as_slice() == i.to_be_bytes()));
    assert_eq!(ro.stat(db)?.entries, 201);
    drop(ro);

    let txn = env.begin_rw()?;
    {
        let mut cur = txn.cursor(db)?;
        cur.set(b"k")?;
        cur.del(true)?;
        let (k, v) = cur.next()?.expect("moved to the next key");
        assert_eq!((k.as_slice(), v.as_slice()), (&b"l"[..], &b"next"[..]));
    }
    txn.commit()?;
    let ro = env.begin_ro()?;
    assert!(ro.get(db, b"k")?.is_none());
    assert_eq!(ro.stat(db)?.entries, 1);
    Ok(())
}

#[test]
fn duplicate_values_are_stored_once() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "tags", DbFlags::DUP_SORT)?;
    let txn = env.begin_rw()?;
    txn.put(db, b"k", b"one", WriteFlags::empty())?;
    txn.put(db, b"k", b"two", WriteFlags::empty())?;
    txn.put(db, b"k", b"one", WriteFlags::empty())?;
    assert!(matches!(
        txn.put(db, b"k", b"two", WriteFlags::NO_DUP_DATA),
        Err(KvError::KeyExist)
    ));
    assert!(matches!(
        txn.put(db, b"k", b"three", WriteFlags::NO_OVERWRITE),
        Err(KvError::KeyExist)
    ));
    assert!(matches!(
        txn.put(db, b"k", b"", WriteFlags::empty()),
        Err(KvError::BadValSize)
    ));
    txn.del(db, b"k", Some(b"one"))?;
    assert!(matches!(txn.del(db, b"k", Some(b"one")), Err(KvError::NotFound)));
    assert_eq!(txn.stat(db)?.entries, 1);
    txn.commit()?;

    let ro = env.begin_ro()?;
    assert_eq!(values_of(&ro, db, b"k")?, vec![b"two".to_vec()]);
    Ok(())
}

#[test]
fn fixed_size_values_share_one_width() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "fixed", DbFlags::DUP_SORT | DbFlags::DUP_FIXED)?;
    let txn = env.begin_rw()?;
    for i in 0..1_000u64 {
        txn.put(db, b"series", &(i * 3).to_be_bytes(), WriteFlags::APPEND_DUP)?;
    }
    assert!(matches!(
        txn.put(db, b"series", &7u32.to_be_bytes(), WriteFlags::empty()),
        Err(KvError::BadValSize)
    ));
    assert!(matches!(
        txn.put(db, b"series", &3u64.to_be_bytes(), WriteFlags::APPEND_DUP),
        Err(KvError::KeyExist)
    ));
    txn.commit()?;

    let ro = env.begin_ro()?;
    let values = values_of(&ro, db, b"series")?;
    assert_eq!(values.len(), 1_000);
    assert_eq!(values[333], 999u64.to_be_bytes().to_vec());
    let mut cur = ro.cursor(db)?;
    let (_, v) = cur
        .get_both_range(b"series", &100u64.to_be_bytes())?
        .expect("next multiple of three");
    assert_eq!(v, &102u64.to_be_bytes()[..]);
    Ok(())
}

#[test]
fn integer_dups_sort_numerically() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "ints", DbFlags::DUP_SORT | DbFlags::INTEGER_DUP)?;
    let numbers = [70_000u32, 3, 256, 1, 65_536, 255];
    let txn = env.begin_rw()?;
    for n in numbers {
        txn.put(db, b"n", &n.to_ne_bytes(), WriteFlags::empty())?;
    }
    assert!(matches!(
        txn.put(db, b"n", &[1, 2, 3], WriteFlags::empty()),
        Err(KvError::BadValSize)
    ));
    txn.commit()?;

    let ro = env.begin_ro()?;
    let seen: Vec<u32> = values_of(&ro, db, b"n")?
        .into_iter()
        .map(|v| u32::from_ne_bytes([v[0], v[1], v[2], v[3]]))
        .collect();
    let mut expected = numbers.to_vec();
    expected.sort_unstable();
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn reverse_dups_compare_from_the_last_byte() -> Result<()> {
    let (_dir, env) = open()?;
    let db = create(&env, "rev", DbFlags::DUP_SORT | DbFlags::REVERSE_DUP)?;
    let txn = env.begin_rw()?;
    for v in [&b"ab"[..], b"ca", b"ba", b"cc"] {
        txn.put(db, b"k", v, WriteFlags::empty())?;
    }
    txn.commit()?;
    let ro = env.begin_ro()?;
    assert_eq!(
        values_of(&ro, db, b"k")?,
        vec![b"ba".to_vec(), b"ca".to_vec(), b"ab".to_vec(), b"cc".to_vec()]
    );
    assert_eq!(ro.db_flags(db)?, DbFlags::DUP_SORT | DbFlags::REVERSE_DUP);
    Ok(())
}

#[test]
fn reopened_database_keeps_its_dup_flags() -> Result<()> {
    let dir = tempdir().unwrap();
    let opts = EnvOptions {
        max_dbs: 2,
        ..EnvOptions::default()
    };
    {
        let env = Environment::open(dir.path(), opts.clone())?;
        let db = create(&env, "tags", DbFlags::DUP_SORT)?;
        let txn = env.begin_rw()?;
        txn.put(db, b"k", b"x", WriteFlags::empty())?;
        txn.put(db, b"k", b"y", WriteFlags::empty())?;
        txn.commit()?;
    }
    let env = Environment::open(dir.path(), opts)?;
    let ro = env.begin_ro()?;
    let db = ro.open_db(Some("tags"), DbFlags::empty())?;
    assert!(ro.db_flags(db)?.contains(DbFlags::DUP_SORT));
    assert_eq!(values_of(&ro, db, b"k")?.len(), 2);
    Ok(())
}
