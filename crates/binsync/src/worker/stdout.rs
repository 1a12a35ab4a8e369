//! Logging destination executor, useful for dry runs.

use async_trait::async_trait;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::protocol::DbConfig;
use crate::worker::{Executor, WorkerEvent, WorkerEventKind};

#[derive(Default)]
pub struct StdoutExecutor {
    in_txn: bool,
    pending: usize,
}

impl StdoutExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Executor for StdoutExecutor {
    async fn attach(&mut self, _dbs: &[DbConfig]) -> Result<()> {
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(SyncError::invalid_state("transaction already open"));
        }
        self.in_txn = true;
        self.pending = 0;
        Ok(())
    }

    async fn exec(&mut self, job: &WorkerEvent) -> Result<()> {
        if !self.in_txn {
            return Err(SyncError::invalid_state("exec outside a transaction"));
        }
        let action = match job.kind {
            WorkerEventKind::Insert => "insert",
            WorkerEventKind::Update => "update",
            WorkerEventKind::Delete => "delete",
        };
        let values: Vec<String> = job.columns.iter().map(|c| c.value_text()).collect();
        info!(
            "{action} {}.{} [{}] at {}",
            job.desc.rewrite_schema,
            job.desc.rewrite_table,
            values.join(", "),
            job.point
        );
        self.pending += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_txn = false;
        self.pending = 0;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(SyncError::invalid_state("commit outside a transaction"));
        }
        info!("committed {} event(s)", self.pending);
        self.in_txn = false;
        self.pending = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transaction_discipline() {
        let mut e = StdoutExecutor::new();
        assert!(e.commit().await.is_err());
        e.begin().await.unwrap();
        assert!(e.begin().await.is_err());
        e.commit().await.unwrap();
        e.rollback().await.unwrap();
    }
}
