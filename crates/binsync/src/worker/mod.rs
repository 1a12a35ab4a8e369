//! Hash-partitioned worker pool with batched transactional apply.
//!
//! The dispatcher shards row events to a fixed pool by partition key;
//! each worker accumulates events and flushes them as transactions through
//! every configured executor, retrying indefinitely on failure. A barrier
//! over the in-flight counter lets the handler persist the replication
//! point only once everything before it has been committed, giving
//! at-least-once delivery.

mod executor;
mod manager;
mod mysql;
mod stdout;
mod worker;

pub use executor::{create_executors, DestinationConfig, Executor, ExecutorKind, SharedExecutor};
pub use manager::{partition_index, JobTracker, WorkerManager};
pub use mysql::MySqlExecutor;
pub use stdout::StdoutExecutor;
pub use worker::WorkerStatus;

use serde::{Deserialize, Serialize};

use crate::rule::SyncDesc;
use crate::slave::ReplicationPoint;
use crate::tableinfo::{ColumnWithValue, TableInfo};
use std::sync::Arc;

/// How row events map to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// Shard by the rewritten `schema.table`.
    #[default]
    TableName,
    /// Shard by the stringified index-column tuple.
    PrimaryKey,
}

impl TryFrom<u8> for DispatchPolicy {
    type Error = crate::error::SyncError;

    fn try_from(v: u8) -> crate::error::Result<Self> {
        match v {
            0 => Ok(Self::TableName),
            1 => Ok(Self::PrimaryKey),
            other => Err(crate::error::SyncError::config(format!(
                "invalid dispatch-policy {other}"
            ))),
        }
    }
}

/// The DML kind of a worker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEventKind {
    Insert,
    Update,
    Delete,
}

/// The handler-to-worker message. Contains only owned data; nothing here
/// borrows from the parser.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub kind: WorkerEventKind,
    pub timestamp: u32,
    pub point: ReplicationPoint,
    pub table: Arc<TableInfo>,
    /// Row image; the before-image for updates.
    pub columns: Vec<ColumnWithValue>,
    /// After-image, updates only.
    pub new_columns: Option<Vec<ColumnWithValue>>,
    pub desc: SyncDesc,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    /// Pool size, minimum 1.
    pub worker_count: usize,
    /// Destinations; every worker applies each batch to all of them.
    pub tos: Vec<DestinationConfig>,
    /// Pending-queue capacity per worker.
    pub queue_size: usize,
    /// Flush a non-empty queue after this long without a commit.
    pub commit_interval_ms: u64,
    /// Backoff between commit retries.
    pub retry_interval_ms: u64,
    /// Cap on commit retries; `None` retries forever.
    pub max_commit_retries: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            tos: Vec::new(),
            queue_size: worker::DEFAULT_QUEUE_SIZE,
            commit_interval_ms: worker::DEFAULT_COMMIT_INTERVAL_MS,
            retry_interval_ms: worker::DEFAULT_RETRY_INTERVAL_MS,
            max_commit_retries: None,
        }
    }
}
