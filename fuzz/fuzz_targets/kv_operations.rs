#![no_main]

use std::collections::BTreeMap;
use std::thread;

use libfuzzer_sys::arbitrary::{self, Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;
use sombra_kv::{Database, EnvOptions, Environment, WriteFlags};

#[derive(Debug, Clone)]
enum Operation {
    Put { key: u16, len: u16 },
    Del { key: u16 },
    Commit,
    Abort,
    Nested { commit: bool, key: u16 },
}

impl<'a> Arbitrary<'a> for Operation {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let op_type: u8 = u.int_in_range(0..=4)?;
        Ok(match op_type {
            0 => Operation::Put {
                key: u.int_in_range(0..=512)?,
                len: u.int_in_range(1..=3000)?,
            },
            1 => Operation::Del {
                key: u.int_in_range(0..=512)?,
            },
            2 => Operation::Commit,
            3 => Operation::Abort,
            _ => Operation::Nested {
                commit: u.arbitrary()?,
                key: u.int_in_range(0..=512)?,
            },
        })
    }
}

fn key_of(k: u16) -> [u8; 2] {
    k.to_be_bytes()
}

fn value_of(k: u16, len: u16) -> Vec<u8> {
    vec![k as u8; len as usize]
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let mut operations = Vec::new();
    while let Ok(op) = Operation::arbitrary(&mut u) {
        operations.push(op);
        if operations.len() >= 200 {
            break;
        }
    }
    if operations.is_empty() {
        return;
    }

    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let opts = EnvOptions {
        page_size: 512,
        map_size: 16 << 20,
        max_dirty_pages: 64,
        ..EnvOptions::default()
    };
    let env = Environment::open(dir.path(), opts).expect("open environment");

    // Readers only ever see totals the writer committed.
    let reader = {
        let env = env.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                let ro = env.begin_ro().expect("begin_ro");
                let entries = ro.stat(Database::MAIN).expect("stat").entries;
                let mut cur = ro.cursor(Database::MAIN).expect("cursor");
                let walked = cur.iter().count() as u64;
                assert_eq!(walked, entries);
            }
        })
    };

    let mut committed: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut pending = committed.clone();
    let mut txn = env.begin_rw().expect("begin_rw");
    for op in operations {
        match op {
            Operation::Put { key, len } => {
                let value = value_of(key, len);
                txn.put(Database::MAIN, &key_of(key), &value, WriteFlags::empty())
                    .expect("put");
                pending.insert(key_of(key).to_vec(), value);
            }
            Operation::Del { key } => {
                let res = txn.del(Database::MAIN, &key_of(key), None);
                assert_eq!(res.is_ok(), pending.remove(&key_of(key)[..]).is_some());
            }
            Operation::Commit => {
                txn.commit().expect("commit");
                committed = pending.clone();
                txn = env.begin_rw().expect("begin_rw");
            }
            Operation::Abort => {
                txn.abort();
                pending = committed.clone();
                txn = env.begin_rw().expect("begin_rw");
            }
            Operation::Nested { commit, key } => {
                let child = txn.nested().expect("nested");
                child
                    .put(Database::MAIN, &key_of(key), b"nested", WriteFlags::empty())
                    .expect("nested put");
                if commit {
                    child.commit().expect("nested commit");
                    pending.insert(key_of(key).to_vec(), b"nested".to_vec());
                }
            }
        }
    }
    txn.commit().expect("final commit");
    reader.join().expect("reader thread");

    let ro = env.begin_ro().expect("begin_ro");
    let mut cur = ro.cursor(Database::MAIN).expect("cursor");
    let items: Vec<(Vec<u8>, Vec<u8>)> = cur
        .iter()
        .map(|item| item.map(|(k, v)| (k.to_vec(), v.to_vec())))
        .collect::<Result<_, _>>()
        .expect("walk");
    let expected: Vec<_> = pending.into_iter().collect();
    assert_eq!(items, expected);
});
