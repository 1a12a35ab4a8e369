//! Application configuration surface.
//!
//! The daemon deserializes this from a YAML file; the types live here so
//! integration tests and embedders can construct them directly.

use serde::{Deserialize, Serialize};

use crate::protocol::DataSource;
use crate::rule::SyncConfig;
use crate::slave::ReplicationConfig;
use crate::worker::WorkerConfig;

/// Logging settings for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppConfig {
    /// Ordered candidate primaries; the engine fails over through them.
    pub data_sources: Vec<DataSource>,
    pub replication: ReplicationConfig,
    pub worker: WorkerConfig,
    /// 0 = shard by rewritten table name, 1 = shard by primary key.
    pub dispatch_policy: u8,
    pub sync_rule: SyncConfig,
    /// e.g. `ls:/var/lib/binsync/checkpoint.json`.
    pub storage_source: String,
    pub log: LogConfig,
}
