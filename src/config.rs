//! Engine and server configuration.
//!
//! A serde-backed struct with
//! `Default`, a fluent builder, and a `validate()` that rejects
//! degenerate values and warns (via `tracing::warn!`) on merely
//! inadvisable ones.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NexaError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexaConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub memtable_size_bytes: usize,
    pub wal_batch_size: usize,
    pub wal_batch_interval: Duration,
    pub sorted_run_compaction_threshold: usize,
    pub bloom_false_positive_rate: f64,
    pub block_cache_entries: usize,
    /// Explicit opt-in to repair a WAL whose last segment header is
    /// unreadable, instead of refusing to start with `CorruptLog`.
    pub repair: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub max_connections: usize,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
    /// Ratio of tombstoned-to-total vectors past which search returns
    /// `IndexUnavailable` until the collection is rebuilt.
    pub hnsw_stale_delete_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Bootstrap-only initial password for `root`. Ignored if root
    /// already has a stored credential.
    pub root_password_initial: Option<String>,
    pub pbkdf2_iterations: u32,
}

impl Default for NexaConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            index: IndexConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./.nexadb"),
            memtable_size_bytes: 64 * 1024 * 1024,
            wal_batch_size: 500,
            wal_batch_interval: Duration::from_micros(1000),
            sorted_run_compaction_threshold: 4,
            bloom_false_positive_rate: 0.01,
            block_cache_entries: 10_000,
            repair: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 6970,
            max_connections: 1024,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
            hnsw_stale_delete_ratio: 0.2,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            root_password_initial: None,
            pbkdf2_iterations: 100_000,
        }
    }
}

impl NexaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> NexaConfigBuilder {
        NexaConfigBuilder::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NexaConfig =
            toml::from_str(s).map_err(|e| NexaError::Internal(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.network.validate()?;
        self.index.validate()?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memtable_size_bytes == 0 {
            return Err(NexaError::Internal(
                "memtable_size_bytes cannot be 0".to_string(),
            ));
        }
        if self.memtable_size_bytes > 4 * 1024 * 1024 * 1024 {
            tracing::warn!(
                size = self.memtable_size_bytes,
                "very large memtable_size_bytes, may consume excessive memory"
            );
        }
        if self.wal_batch_size == 0 {
            return Err(NexaError::Internal("wal_batch_size cannot be 0".to_string()));
        }
        if self.sorted_run_compaction_threshold == 0 {
            return Err(NexaError::Internal(
                "sorted_run_compaction_threshold cannot be 0".to_string(),
            ));
        }
        if !(0.0 < self.bloom_false_positive_rate && self.bloom_false_positive_rate < 1.0) {
            return Err(NexaError::Internal(
                "bloom_false_positive_rate must be in (0, 1)".to_string(),
            ));
        }
        if self.bloom_false_positive_rate > 0.1 {
            tracing::warn!(
                rate = self.bloom_false_positive_rate,
                "high bloom false-positive rate, effectiveness reduced"
            );
        }
        if self.block_cache_entries == 0 {
            return Err(NexaError::Internal(
                "block_cache_entries cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(NexaError::Internal("max_connections cannot be 0".to_string()));
        }
        Ok(())
    }
}

impl IndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hnsw_m == 0 {
            return Err(NexaError::Internal("hnsw_m cannot be 0".to_string()));
        }
        if self.hnsw_ef_construction < self.hnsw_m {
            tracing::warn!(
                "hnsw_ef_construction smaller than hnsw_m, recall will suffer"
            );
        }
        if !(0.0..=1.0).contains(&self.hnsw_stale_delete_ratio) {
            return Err(NexaError::Internal(
                "hnsw_stale_delete_ratio must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct NexaConfigBuilder {
    data_dir: Option<PathBuf>,
    memtable_size_bytes: Option<usize>,
    bind_host: Option<String>,
    bind_port: Option<u16>,
    max_connections: Option<usize>,
}

impl NexaConfigBuilder {
    pub fn data_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn memtable_size_bytes(mut self, size: usize) -> Self {
        self.memtable_size_bytes = Some(size);
        self
    }

    pub fn bind_host<S: Into<String>>(mut self, host: S) -> Self {
        self.bind_host = Some(host.into());
        self
    }

    pub fn bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n);
        self
    }

    pub fn build(self) -> Result<NexaConfig> {
        let defaults = NexaConfig::default();
        let config = NexaConfig {
            storage: StorageConfig {
                data_dir: self.data_dir.unwrap_or(defaults.storage.data_dir),
                memtable_size_bytes: self
                    .memtable_size_bytes
                    .unwrap_or(defaults.storage.memtable_size_bytes),
                ..defaults.storage
            },
            network: NetworkConfig {
                bind_host: self.bind_host.unwrap_or(defaults.network.bind_host),
                bind_port: self.bind_port.unwrap_or(defaults.network.bind_port),
                max_connections: self
                    .max_connections
                    .unwrap_or(defaults.network.max_connections),
                ..defaults.network
            },
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NexaConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_memtable_size() {
        let mut cfg = StorageConfig::default();
        cfg.memtable_size_bytes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bloom_rate_out_of_range() {
        let mut cfg = StorageConfig::default();
        cfg.bloom_false_positive_rate = 1.0;
        assert!(cfg.validate().is_err());
        cfg.bloom_false_positive_rate = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = NexaConfig::builder()
            .data_dir("/tmp/nexadb-test")
            .bind_port(7000)
            .max_connections(16)
            .build()
            .unwrap();
        assert_eq!(cfg.storage.data_dir, PathBuf::from("/tmp/nexadb-test"));
        assert_eq!(cfg.network.bind_port, 7000);
        assert_eq!(cfg.network.max_connections, 16);
    }
}
