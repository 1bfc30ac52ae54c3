use std::fs;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::pager::valid_page_size;
use crate::types::DEFAULT_PAGE_SIZE;

/// How much a commit waits for the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Flush data pages, then flush the meta page.
    #[default]
    Full,
    /// Flush data pages; the meta page reaches disk with the next flush.
    Normal,
    /// Leave flushing to the OS. A crash may lose recent commits.
    Off,
}

/// Options fixed when an environment is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvOptions {
    /// Size of the memory map in bytes; bounds the data file.
    pub map_size: u64,
    /// Page size used when creating a new file. Existing files keep theirs.
    pub page_size: u32,
    /// Reader table slots.
    pub max_readers: u32,
    /// Named databases besides FREE and MAIN.
    pub max_dbs: u32,
    /// Commit durability.
    pub synchronous: Synchronous,
    /// Write committed pages through a writable map instead of `pwrite`.
    pub write_map: bool,
    /// The path names the data file itself; the lock file sits next to it
    /// with a `-lock` suffix.
    pub no_sub_dir: bool,
    /// Open without write access.
    pub read_only: bool,
    /// Dirty pages a write transaction holds before spilling to the file.
    pub max_dirty_pages: usize,
    /// Fraction (1/n) of the dirty pages written out by one spill.
    pub spill_divisor: usize,
    /// Permission bits of created files.
    pub file_mode: u32,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            map_size: 10 * 1024 * 1024,
            page_size: DEFAULT_PAGE_SIZE as u32,
            max_readers: 126,
            max_dbs: 0,
            synchronous: Synchronous::Full,
            write_map: false,
            no_sub_dir: false,
            read_only: false,
            max_dirty_pages: 131_071,
            spill_divisor: 8,
            file_mode: 0o644,
        }
    }
}

impl EnvOptions {
    /// Every commit reaches disk before it returns.
    pub fn fully_durable() -> Self {
        Self::default()
    }

    /// No flushing and a writable map; for benchmarks and scratch data.
    pub fn benchmark() -> Self {
        Self {
            map_size: 1 << 30,
            synchronous: Synchronous::Off,
            write_map: true,
            ..Self::default()
        }
    }

    /// Parses options from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let opts: EnvOptions = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads options from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let opts: EnvOptions = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })?;
        opts.validate()?;
        Ok(opts)
    }

    /// Serializes the options as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !valid_page_size(self.page_size as usize) {
            return Err(ConfigError::Invalid(format!(
                "page_size {} must be a power of two between 512 and 32768",
                self.page_size
            )));
        }
        if self.map_size < 4 * u64::from(self.page_size) {
            return Err(ConfigError::Invalid(format!(
                "map_size {} is smaller than four pages",
                self.map_size
            )));
        }
        if self.max_readers == 0 {
            return Err(ConfigError::Invalid("max_readers must be positive".into()));
        }
        if self.max_dirty_pages < 32 {
            return Err(ConfigError::Invalid("max_dirty_pages must be at least 32".into()));
        }
        if self.spill_divisor == 0 {
            return Err(ConfigError::Invalid("spill_divisor must be positive".into()));
        }
        Ok(())
    }
}

/// Errors raised while loading [`EnvOptions`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document is not valid TOML for these options.
    #[error("failed to parse config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File that failed, if the text came from one.
        path: Option<PathBuf>,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The options could not be written out.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// A value is out of range.
    #[error("{0}")]
    Invalid(String),
}

bitflags! {
    /// Per-database flags. All but `CREATE` are stored with the database.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DbFlags: u32 {
        /// Compare keys starting from their last byte.
        const REVERSE_KEY = 0x02;
        /// Allow several sorted values per key.
        const DUP_SORT = 0x04;
        /// Keys are native-endian `u32` or `u64`.
        const INTEGER_KEY = 0x08;
        /// Duplicate values all have the same size.
        const DUP_FIXED = 0x10;
        /// Duplicate values are native-endian integers.
        const INTEGER_DUP = 0x20;
        /// Compare duplicate values starting from their last byte.
        const REVERSE_DUP = 0x40;
        /// Create the named database if it does not exist.
        const CREATE = 0x4_0000;
    }
}

impl DbFlags {
    /// Flags that are recorded on disk.
    pub const PERSISTENT: DbFlags = DbFlags::REVERSE_KEY
        .union(DbFlags::DUP_SORT)
        .union(DbFlags::INTEGER_KEY)
        .union(DbFlags::DUP_FIXED)
        .union(DbFlags::INTEGER_DUP)
        .union(DbFlags::REVERSE_DUP);

    /// Persistent part of the flags.
    pub fn persistent(self) -> DbFlags {
        self & DbFlags::PERSISTENT
    }

    /// Flags as stored in a database record.
    pub(crate) fn to_record(self) -> u16 {
        self.persistent().bits() as u16
    }

    /// Flags read back from a database record.
    pub(crate) fn from_record(bits: u16) -> DbFlags {
        DbFlags::from_bits_truncate(u32::from(bits)).persistent()
    }
}

bitflags! {
    /// Options of a single put.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct WriteFlags: u32 {
        /// Fail with `KeyExist` if the key is already present.
        const NO_OVERWRITE = 0x10;
        /// Fail with `KeyExist` if the key/value pair is already present.
        const NO_DUP_DATA = 0x20;
        /// Replace the item under the cursor.
        const CURRENT = 0x40;
        /// Reserve space and let the caller fill it.
        const RESERVE = 0x1_0000;
        /// The key sorts after every existing key.
        const APPEND = 0x2_0000;
        /// The value sorts after every value of its key.
        const APPEND_DUP = 0x4_0000;
    }
}
