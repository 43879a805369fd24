//! Runtime configuration read from environment variables.

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

use crate::blockchain::pow::DEFAULT_DIFFICULTY;

const DATA_DIR_VAR: &str = "LEDGER_DATA_DIR";
const DIFFICULTY_VAR: &str = "LEDGER_DIFFICULTY";
const BIND_ADDR_VAR: &str = "LEDGER_BIND_ADDR";
const PORT_VAR: &str = "LEDGER_PORT";

/// Hard ceiling on proof difficulty; beyond this mining never finishes in practice
const MAX_DIFFICULTY: usize = 16;

/// Errors that can occur while reading configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding the ledger database
    pub data_dir: PathBuf,
    /// Leading zero hex digits required of a proof
    pub difficulty: usize,
    /// HTTP bind address
    pub bind_addr: String,
    /// HTTP port
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/ledger"),
            difficulty: DEFAULT_DIFFICULTY,
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable lookup, falling back to
    /// defaults for anything unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup(DATA_DIR_VAR) {
            if dir.trim().is_empty() {
                return Err(invalid(DATA_DIR_VAR, dir, "must not be empty"));
            }
            config.data_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup(DIFFICULTY_VAR) {
            let difficulty: usize = raw
                .trim()
                .parse()
                .map_err(|e: ParseIntError| invalid(DIFFICULTY_VAR, raw.clone(), e.to_string()))?;
            if difficulty == 0 || difficulty > MAX_DIFFICULTY {
                return Err(invalid(
                    DIFFICULTY_VAR,
                    raw,
                    format!("must be between 1 and {}", MAX_DIFFICULTY),
                ));
            }
            config.difficulty = difficulty;
        }

        if let Some(addr) = lookup(BIND_ADDR_VAR) {
            config.bind_addr = addr;
        }

        if let Some(raw) = lookup(PORT_VAR) {
            config.port = raw
                .trim()
                .parse()
                .map_err(|e: ParseIntError| invalid(PORT_VAR, raw.clone(), e.to_string()))?;
        }

        Ok(config)
    }
}

fn invalid(key: &'static str, value: String, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value,
        reason: reason.into(),
    }
}
