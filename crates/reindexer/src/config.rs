use crate::clock::from_unix_ms;
use crate::{Cluster, DocumentType, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_MAINTENANCE_INTERVAL_MS: u64 = 60_000;
const DEFAULT_LOCK_STALE_AFTER_MS: u64 = 600_000;
const DEFAULT_STORE_PATH: &str = "reindexing.json";

/// Reindexing setup of one cluster, usually read from a TOML file:
///
/// ```toml
/// lock_timeout_ms = 1000
/// store_path = "/var/lib/reindexer/music.json"
///
/// [cluster]
/// name = "music"
/// config_id = "music/storage"
///
/// [cluster.bucket_spaces]
/// music = "default"
///
/// [ready_at]
/// music = 1700000000000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexerConfig {
    pub cluster: Cluster,
    /// Not-before instant of each document type, in unix milliseconds.
    #[serde(default)]
    pub ready_at: BTreeMap<DocumentType, u64>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,
    #[serde(default = "default_lock_stale_after_ms")]
    pub lock_stale_after_ms: u64,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
}

const fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

const fn default_maintenance_interval_ms() -> u64 {
    DEFAULT_MAINTENANCE_INTERVAL_MS
}

const fn default_lock_stale_after_ms() -> u64 {
    DEFAULT_LOCK_STALE_AFTER_MS
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

impl ReindexerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads a config file. A relative `store_path` resolves against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        if config.store_path.is_relative() {
            if let Some(dir) = path.parent() {
                config.store_path = dir.join(&config.store_path);
            }
        }
        Ok(config)
    }

    #[must_use]
    pub fn ready_at(&self) -> BTreeMap<DocumentType, SystemTime> {
        self.ready_at
            .iter()
            .map(|(document_type, ms)| (document_type.clone(), from_unix_ms(*ms)))
            .collect()
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    #[must_use]
    pub const fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }
}
