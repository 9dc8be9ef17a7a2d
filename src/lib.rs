pub mod adapters;
pub mod auth;
pub mod datastore;
pub mod model;
pub mod prelude;
pub mod query;
pub mod schema;
pub mod serve;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct LoggingConfig {
    /// Maximum tracing level; defaults to `info`.
    pub max_level: Option<String>,
}

/// Root configuration, loaded from `tempo.toml` plus `TEMPO_*` environment
/// overrides.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub storage: tempo_core::StorageConfig,
    pub retention: tempo_core::RetentionConfig,
    pub write: tempo_core::WriteConfig,
    pub query: tempo_core::QueryConfig,
    pub cache: tempo_core::CacheConfig,
    pub throughput: tempo_core::ThroughputConfig,
    pub maintenance: tempo_core::MaintenanceConfig,
    pub serve: serve::ServeConfig,
    pub logging: LoggingConfig,
}
