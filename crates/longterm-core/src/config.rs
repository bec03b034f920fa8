//! longterm.toml configuration parser.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults that match a stock host-only VirtualBox setup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alloc::{IdentitySpace, Subnet};
use crate::duration::{DurationError, parse_duration};
use crate::tags::{LONGTERM_TAG, TagSet};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid [network] section: {0}")]
    Network(String),

    #[error("invalid [identity] section: {0}")]
    Identity(String),

    #[error("invalid [fleet] section: {0}")]
    Fleet(String),

    #[error("invalid [clone] section: {0}")]
    Clone(String),

    #[error("invalid watch interval: {0}")]
    WatchInterval(#[from] DurationError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LongtermConfig {
    pub store: StoreConfig,
    pub network: Subnet,
    pub identity: IdentitySpace,
    pub fleet: FleetConfig,
    pub clone: CloneConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. Defaults to `<data-dir>/longterm.redb`.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Minimum number of free longterm machines to keep around.
    pub floor: usize,
    /// Tags every provisioned machine carries and availability is counted by.
    pub tags: Vec<String>,
    /// Re-check period for `watch` mode (e.g., "5m").
    pub watch_interval: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            floor: 5,
            tags: vec![LONGTERM_TAG.to_string()],
            watch_interval: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloneConfig {
    /// Clone tool executable.
    pub command: String,
    /// Base image the clones are made from.
    pub bird: String,
    /// Sandbox installation the clones are registered with.
    /// Defaults to the current directory.
    pub cuckoo_root: Option<PathBuf>,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            command: "vmcloak-clone".to_string(),
            bird: "bird0".to_string(),
            cuckoo_root: None,
        }
    }
}

impl LongtermConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LongtermConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints once, before anything uses the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.first_octet == 0 {
            return Err(ConfigError::Network("first_octet must be above 0".into()));
        }
        if self.network.first_octet >= self.network.broadcast_octet {
            return Err(ConfigError::Network(format!(
                "first_octet {} must be below broadcast_octet {}",
                self.network.first_octet, self.network.broadcast_octet
            )));
        }
        if self.identity.width == 0 {
            return Err(ConfigError::Identity("width must be at least 1".into()));
        }
        if self.fleet.tags.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::Fleet("at least one tag is required".into()));
        }
        if self.clone.command.trim().is_empty() {
            return Err(ConfigError::Clone("command must not be empty".into()));
        }
        if self.watch_interval_secs()? == 0 {
            return Err(ConfigError::Fleet("watch_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Resolve the database file relative to a data directory.
    pub fn store_path(&self, data_dir: &Path) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir.join("longterm.redb"))
    }

    /// Tags that identify provisioned longterm machines.
    pub fn fleet_tags(&self) -> TagSet {
        self.fleet
            .tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn watch_interval_secs(&self) -> Result<u64, DurationError> {
        parse_duration(&self.fleet.watch_interval)
    }
}
