use std::fs;
use std::path::{Path, PathBuf};

use busbridge_protocol::BusType;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Bus returned by `Runtime::default_bus`.
    pub default_bus: BusType,
    /// Timeout for `Connection::read_write_default`, in milliseconds.
    /// `-1` blocks until there is I/O.
    pub read_write_timeout_ms: i32,
    /// Registry inserts between sweeps of dead entries; `0` disables sweeping.
    pub registry_sweep_interval: usize,
    /// Default `env_logger` filter for binaries embedding the bridge.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_bus: BusType::Session,
            read_write_timeout_ms: -1,
            registry_sweep_interval: 64,
            log_filter: "warn".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_write_timeout_ms < -1 {
            return Err(ConfigError::Invalid(format!(
                "read_write_timeout_ms must be -1 or greater (got {})",
                self.read_write_timeout_ms
            )));
        }
        Ok(())
    }
}
