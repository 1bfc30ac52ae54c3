//! Embedded, memory-mapped key/value store.
//!
//! Data lives in a single file of fixed-size pages organised as
//! copy-on-write B+trees. Readers map the file and walk committed pages
//! directly; a single writer builds new pages beside the old ones and
//! publishes them by flipping one of two meta pages. Freed pages are
//! recorded per transaction and reused once no reader can still see them.
//!
//! ```no_run
//! use sombra_kv::{Database, EnvOptions, Environment, WriteFlags};
//!
//! # fn main() -> sombra_kv::Result<()> {
//! let env = Environment::open("/tmp/kv", EnvOptions::default())?;
//! let txn = env.begin_rw()?;
//! txn.put(Database::MAIN, b"hello", b"world", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let ro = env.begin_ro()?;
//! assert_eq!(ro.get(Database::MAIN, b"hello")?, Some(&b"world"[..]));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{
    ConfigError, Database, DbFlags, EnvInfo, EnvOptions, Environment, Iter, NestedTxn, RoCursor,
    RoTxn, RwCursor, RwTxn, Stat, Synchronous, WriteFlags,
};
pub use storage::btree::CompareFn;
pub use storage::{BTreeStatsSnapshot, ReaderInfo};
pub use types::{KvError, Result};
