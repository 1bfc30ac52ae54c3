//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, the memory map, the lock file, and the
//! page formats.

/// Process-shared lock file and reader table.
pub mod concurrency;

/// I/O abstractions and utilities.
pub mod io;

/// Memory map of the data file.
pub mod map;

/// Page and meta page layouts.
pub mod pager;
