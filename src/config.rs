//! Engine configuration.
//!
//! All sections deserialize with defaults, so a TOML file only needs the keys
//! it wants to override:
//!
//! ```toml
//! data_path = "./data"
//! batch_size = 512
//!
//! [wal]
//! sync_interval = "500ms"
//!
//! [shard]
//! max_size = 1073741824
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Top-level configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for WAL, redo logs and index metadata.
    pub data_path: PathBuf,
    /// Identifier of this node. Overwritten by [`Cluster::join`](crate::cluster::Cluster::join)
    /// in cluster mode.
    pub node_id: u64,
    /// Maximum number of merged documents per sub-shard in one segment batch.
    pub batch_size: usize,
    pub wal: WalConfig,
    pub shard: ShardConfig,
    pub mapping: MappingConfig,
    pub cluster: ClusterConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_path: PathBuf::from("./data"),
            node_id: 1,
            batch_size: 1024,
            wal: WalConfig::default(),
            shard: ShardConfig::default(),
            mapping: MappingConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TesseraError::invalid_argument("batch_size must be > 0"));
        }
        if self.wal.max_batch_entries == 0 {
            return Err(TesseraError::invalid_argument(
                "wal.max_batch_entries must be > 0",
            ));
        }
        if self.shard.concurrency == 0 {
            return Err(TesseraError::invalid_argument(
                "shard.concurrency must be > 0",
            ));
        }
        if self.shard.num == 0 {
            return Err(TesseraError::invalid_argument("shard.num must be > 0"));
        }
        parse_interval(&self.wal.sync_interval)?;
        parse_interval(&self.cluster.lock_timeout)?;
        Ok(())
    }
}

/// WAL consumption settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Scheduler tick, e.g. `"1s"` or `"10ms"`.
    pub sync_interval: String,
    /// Skip fsync on redo-log checkpoint writes.
    pub redo_no_sync: bool,
    /// Upper bound on WAL entries read in one consumption run.
    pub max_batch_entries: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            sync_interval: "1s".to_string(),
            redo_no_sync: false,
            max_batch_entries: 10_000,
        }
    }
}

impl WalConfig {
    pub fn sync_interval(&self) -> Result<Duration> {
        parse_interval(&self.sync_interval)
    }
}

/// Shard sizing and fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    /// On-disk size in bytes past which the current sub-shard is rolled.
    pub max_size: u64,
    /// Number of index shards a new index starts with.
    pub num: usize,
    /// Parallelism limit for WAL consumption and sub-shard fan-out.
    pub concurrency: usize,
}

impl Default for ShardConfig {
    fn default() -> Self {
        ShardConfig {
            max_size: 1024 * 1024 * 1024,
            num: 3,
            concurrency: num_cpus::get().max(1),
        }
    }
}

/// Mapping inference switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    /// Register a `.keyword` sub-field for every inferred `text` field.
    pub auto_keyword: bool,
}

/// Cluster-mode settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// How long to wait for a distributed lock, e.g. `"10s"`.
    pub lock_timeout: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            enabled: false,
            lock_timeout: "10s".to_string(),
        }
    }
}

impl ClusterConfig {
    pub fn lock_timeout(&self) -> Result<Duration> {
        parse_interval(&self.lock_timeout)
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn data_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.data_path = path.into();
        self
    }

    pub fn node_id(mut self, node_id: u64) -> Self {
        self.config.node_id = node_id;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn sync_interval(mut self, interval: impl Into<String>) -> Self {
        self.config.wal.sync_interval = interval.into();
        self
    }

    pub fn max_batch_entries(mut self, entries: u64) -> Self {
        self.config.wal.max_batch_entries = entries;
        self
    }

    pub fn shard_max_size(mut self, bytes: u64) -> Self {
        self.config.shard.max_size = bytes;
        self
    }

    pub fn shard_num(mut self, num: usize) -> Self {
        self.config.shard.num = num;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.shard.concurrency = concurrency;
        self
    }

    pub fn auto_keyword(mut self, enabled: bool) -> Self {
        self.config.mapping.auto_keyword = enabled;
        self
    }

    pub fn cluster(mut self, enabled: bool) -> Self {
        self.config.cluster.enabled = enabled;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse an interval such as `"1s"`, `"10ms"` or a bare number of seconds.
/// An empty string means one second.
pub fn parse_interval(value: &str) -> Result<Duration> {
    let v = value.trim().to_lowercase();
    if v.is_empty() {
        return Ok(Duration::from_secs(1));
    }
    let invalid = |_| TesseraError::invalid_argument(format!("invalid interval [{value}]"));
    if let Some(ms) = v.strip_suffix("ms") {
        return ms.trim().parse::<u64>().map(Duration::from_millis).map_err(invalid);
    }
    if let Some(s) = v.strip_suffix('s') {
        return s.trim().parse::<u64>().map(Duration::from_secs).map_err(invalid);
    }
    v.parse::<u64>().map(Duration::from_secs).map_err(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_interval("10ms").unwrap(), Duration::from_millis(10));
        assert_eq!(parse_interval("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_interval("3").unwrap(), Duration::from_secs(3));
        assert!(parse_interval("fast").is_err());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            batch_size = 16

            [shard]
            max_size = 1024

            [mapping]
            auto_keyword = true
            "#,
        )
        .unwrap();

        assert_eq!(config.batch_size, 16);
        assert_eq!(config.shard.max_size, 1024);
        assert_eq!(config.shard.num, 3);
        assert!(config.mapping.auto_keyword);
        assert_eq!(config.wal.sync_interval().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_validates() {
        assert!(EngineConfig::builder().batch_size(0).build().is_err());
        let config = EngineConfig::builder()
            .batch_size(8)
            .sync_interval("20ms")
            .build()
            .unwrap();
        assert_eq!(config.batch_size, 8);
    }
}
