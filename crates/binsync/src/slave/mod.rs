//! The replication slave engine.
//!
//! Owns the connection lifecycle: handshake, checksum and heartbeat
//! negotiation, `COM_REGISTER_SLAVE`, the binlog dump request and the
//! background pump that turns packets into decoded events on a bounded
//! queue. Connection failures are retried with a timed backoff and rotate
//! through the configured data sources.

mod engine;

pub use engine::{Slave, SlaveStatus};

use serde::{Deserialize, Serialize};

/// A monotonically advancing position on the primary's binlog coordinate
/// space.
///
/// The filename changes on rotate; the offset tracks the header `log_pos`
/// of the next event. Persisted only at dispatch barriers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationPoint {
    pub filename: String,
    pub offset: u32,
    #[serde(default)]
    pub gtid: String,
}

impl std::fmt::Display for ReplicationPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}({})", self.filename, self.offset, self.gtid)
    }
}

/// Replication settings for the slave engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReplicationConfig {
    /// Registered in `COM_REGISTER_SLAVE`; must be unique among replicas
    /// and non-zero.
    pub slave_id: u32,
    /// GTID mode; only valid against MariaDB primaries.
    pub enable_gtid: bool,
    /// Capacity of the engine-to-handler event channel.
    pub event_buffer_size: usize,
    /// TCP keepalive period in seconds; 0 disables it.
    pub keepalive_period: u64,
    /// Hostname reported in `COM_REGISTER_SLAVE`, usually empty.
    pub report_host: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            slave_id: 0,
            enable_gtid: false,
            event_buffer_size: engine::DEFAULT_EVENT_BUFFER_SIZE,
            keepalive_period: 0,
            report_host: String::new(),
        }
    }
}
