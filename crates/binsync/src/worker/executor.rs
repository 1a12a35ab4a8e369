//! The executor contract and the destination factory.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::DbConfig;
use crate::worker::mysql::MySqlExecutor;
use crate::worker::stdout::StdoutExecutor;
use crate::worker::WorkerEvent;

/// A destination for replicated row events.
///
/// Batches are applied as `begin -> exec* -> commit`, with `rollback` on
/// the first exec failure. Implementations serialise their own transaction
/// state; the worker holds the executor lock across a whole batch.
#[async_trait]
pub trait Executor: Send {
    /// Supply the backing connections.
    async fn attach(&mut self, dbs: &[DbConfig]) -> Result<()>;
    async fn begin(&mut self) -> Result<()>;
    async fn exec(&mut self, job: &WorkerEvent) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
}

/// An executor shared by all workers.
pub type SharedExecutor = Arc<Mutex<Box<dyn Executor>>>;

/// The closed set of destination kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    MySql,
    Stdout,
}

/// One `worker.tos[]` entry: an executor kind plus its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestinationConfig {
    pub kind: ExecutorKind,
    /// Backup connections for database destinations; the executor rotates
    /// through them on sustained dial failure.
    #[serde(default)]
    pub dbs: Vec<DbConfig>,
}

/// Build one executor per destination.
pub async fn create_executors(tos: &[DestinationConfig]) -> Result<Vec<SharedExecutor>> {
    let mut executors = Vec::with_capacity(tos.len());
    for dest in tos {
        let mut executor: Box<dyn Executor> = match dest.kind {
            ExecutorKind::MySql => Box::new(MySqlExecutor::new()),
            ExecutorKind::Stdout => Box::new(StdoutExecutor::new()),
        };
        executor.attach(&dest.dbs).await?;
        executors.push(Arc::new(Mutex::new(executor)));
    }
    Ok(executors)
}
