//! Environments, transactions and cursors.
//!
//! An [`Environment`] owns one data file and its lock file. Readers take
//! [`RoTxn`] snapshots that never block; a single [`RwTxn`] at a time
//! writes copy-on-write pages and publishes them with one meta page write.

mod config;
mod copy;
mod cursor;
mod env;
mod txn;


pub use config::{ConfigError, DbFlags, EnvOptions, Synchronous, WriteFlags};
pub use cursor::{Iter, RoCursor, RwCursor};
pub use env::{Database, EnvInfo, Environment};
pub use txn::{NestedTxn, RoTxn, RwTxn, Stat};
