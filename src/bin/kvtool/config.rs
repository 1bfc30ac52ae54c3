use serde::Deserialize;
use sombra_kv::EnvOptions;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Settings read from the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CliConfig {
    /// Environment used when a command is given no path.
    pub default_path: Option<PathBuf>,
    /// Options every environment is opened with.
    pub env: EnvOptions,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CliConfig = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config
            .env
            .validate()
            .map_err(|source| ConfigError::Options {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    pub fn resolve_path(&self, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
        explicit
            .or_else(|| self.default_path.clone())
            .ok_or(ConfigError::MissingPath)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid environment options in {path}: {source}")]
    Options {
        path: PathBuf,
        source: sombra_kv::ConfigError,
    },
    #[error("no environment path given and the config sets no default_path")]
    MissingPath,
}
