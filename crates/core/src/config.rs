//! Configuration sections shared by the engine and the CLI.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keys::Bucketing;
use crate::Timestamp;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory where to find storage. If undefined, ephemeral storage
    /// will be used.
    pub path: Option<PathBuf>,

    /// Prefix for every table name owned by this deployment.
    pub table_space: String,

    /// Size (in Mb) of memory allocated for store caching.
    pub cache_mb: Option<usize>,
}

impl StorageConfig {
    pub fn is_ephemeral(&self) -> bool {
        self.path.is_none()
    }

    pub fn table_name(&self, suffix: &str) -> String {
        format!("{}_{}", self.table_space, suffix)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data")),
            table_space: "tempo".into(),
            cache_mb: None,
        }
    }
}

/// Retention window geometry.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RetentionConfig {
    /// Milliseconds of history to keep; older blocks are rotated away.
    pub history: Timestamp,

    /// How many blocks the history is divided into.
    pub history_blocks: usize,
}

impl RetentionConfig {
    pub fn bucketing(&self) -> Result<Bucketing, ConfigError> {
        Bucketing::new(self.history, self.history_blocks)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            history: 60 * 60 * 1000,
            history_blocks: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WriteConfig {
    /// Scheduled-IO pool size for batch flushes.
    pub writers: usize,

    /// Seconds to wait for more datapoints before flushing a batch.
    pub write_delay: u64,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            writers: 5,
            write_delay: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct QueryConfig {
    /// Fan-out pool size for per-index-key datapoint queries.
    pub readers: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { readers: 20 }
    }
}

/// LRU capacities. Zero disables the cache in question.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    pub datapoints: usize,
    pub query_index_key: usize,
    pub write_index_key: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            datapoints: 400,
            query_index_key: 400,
            write_index_key: 400,
        }
    }
}

/// Provisioned-throughput targets for the per-block tables.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct ThroughputConfig {
    pub read_datapoints: u64,
    pub write_datapoints: u64,
    pub read_index_key: u64,
    pub write_index_key: u64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            read_datapoints: 80,
            write_datapoints: 160,
            read_index_key: 80,
            write_index_key: 160,
        }
    }
}

/// Thresholds driving the maintenance loop.
#[derive(Serialize, Deserialize, Clone, Copy, Debug)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Minutes remaining in the current block below which the next block
    /// gets created.
    pub create_next_min: i64,

    /// Same threshold as a percentage of the block size; the larger of
    /// the two wins.
    pub create_next_pct: f64,

    /// Minutes elapsed into the current block after which the previous
    /// block is turned down.
    pub turndown_min: i64,

    /// Same threshold as a percentage of the block size; the smaller of
    /// the two wins.
    pub turndown_pct: f64,
}

impl MaintenanceConfig {
    pub fn create_next_threshold(&self, block_size: Timestamp) -> Timestamp {
        let minutes = self.create_next_min * 60 * 1000;
        let pct = (block_size as f64 * self.create_next_pct / 100.0) as Timestamp;
        minutes.max(pct)
    }

    pub fn turndown_threshold(&self, block_size: Timestamp) -> Timestamp {
        let minutes = self.turndown_min * 60 * 1000;
        let pct = (block_size as f64 * self.turndown_pct / 100.0) as Timestamp;
        minutes.min(pct)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            create_next_min: 4,
            create_next_pct: 15.0,
            turndown_min: 2,
            turndown_pct: 20.0,
        }
    }
}
