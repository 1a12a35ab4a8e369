//! The event handler: the single consumer between the slave engine and the
//! worker pool.
//!
//! Classifies decoded events, augments rows events with table metadata and
//! the resolved sync rule, shards the resulting worker events, and persists
//! the replication point whenever a dispatch barrier completes.

use std::collections::HashMap;
use std::sync::Arc;

use mysql_async::{Opts, OptsBuilder, Pool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::binlog::{BinlogEvent, Event, EventHeader, RowAction, RowsEvent};
use crate::checkpoint::PointStore;
use crate::error::{Result, SyncError};
use crate::protocol::DataSource;
use crate::slave::Slave;
use crate::tableinfo::{fill_columns_with_values, load_table_info, table_key, TableInfo};
use crate::worker::{DispatchPolicy, WorkerEvent, WorkerEventKind, WorkerManager};

/// Drives replication: engine -> handler -> workers -> checkpoint.
pub struct Pipeline {
    slave: Slave,
    manager: WorkerManager,
    points: PointStore,
    policy: DispatchPolicy,
    tables: HashMap<String, Arc<TableInfo>>,
    metadata: Pool,
    cancel: CancellationToken,
}

impl Pipeline {
    /// `metadata_source` is the primary used for `SHOW COLUMNS` / `SHOW
    /// INDEX` lookups.
    pub fn new(
        slave: Slave,
        manager: WorkerManager,
        points: PointStore,
        policy: DispatchPolicy,
        metadata_source: &DataSource,
        cancel: CancellationToken,
    ) -> Self {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(metadata_source.host.clone())
            .tcp_port(metadata_source.port)
            .user(Some(metadata_source.username.clone()))
            .pass(Some(metadata_source.password.clone()))
            .into();
        Self {
            slave,
            manager,
            points,
            policy,
            tables: HashMap::new(),
            metadata: Pool::new(opts),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Consume events until cancellation or a fatal error. The point store
    /// is saved and the workers are drained on the way out.
    pub async fn run(mut self) -> Result<()> {
        let result = self.consume().await;
        self.shutdown().await;
        result
    }

    async fn consume(&mut self) -> Result<()> {
        loop {
            let cancel = self.cancel.clone();
            let event = match self.slave.next(&cancel).await {
                Ok(event) => event,
                Err(SyncError::UserClosed) => {
                    info!("replication stopped by user");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.on_event(event).await?;
        }
    }

    async fn on_event(&mut self, event: Event) -> Result<()> {
        match event.payload {
            BinlogEvent::Rows(rows) => self.on_rows_event(&event.header, rows).await,
            BinlogEvent::Rotate(rotate) => {
                info!("rotate to binlog {}:{}", rotate.next_name, rotate.position);
                Ok(())
            }
            BinlogEvent::Query(query) => {
                debug!("query event: {}", query.query);
                Ok(())
            }
            BinlogEvent::Xid(xid) => {
                debug!("source transaction commit, xid {}", xid.xid);
                Ok(())
            }
            BinlogEvent::Gtid(gtid) => {
                debug!("gtid {}", gtid.gtid_string());
                Ok(())
            }
            BinlogEvent::MariadbGtid(gtid) => {
                debug!("mariadb gtid {}", gtid.gtid_string());
                Ok(())
            }
            BinlogEvent::FormatDescription(fd) => {
                debug!(
                    "format description: binlog v{} server {}",
                    fd.binlog_version, fd.server_version
                );
                Ok(())
            }
            BinlogEvent::RowsQuery(q) => {
                debug!("rows query: {}", q.query);
                Ok(())
            }
            BinlogEvent::Heartbeat(_) | BinlogEvent::TableMap(_) | BinlogEvent::Skipped(_) => {
                Ok(())
            }
        }
    }

    async fn on_rows_event(&mut self, header: &EventHeader, rows: RowsEvent) -> Result<()> {
        let ti = self.table_info_for(&rows).await?;
        let point = self.slave.current_point();
        let jobs = build_worker_events(header, &rows, &ti, &point)?;

        for job in jobs {
            let point_checked = self.manager.dispatch(job, self.policy).await?;
            if point_checked {
                // Every event before the barrier is committed; the point is
                // safe to persist.
                let point = self.slave.current_point();
                self.points.write_point(&point).await?;
            }
        }
        Ok(())
    }

    /// Cached table metadata, invalidated and reloaded exactly once when
    /// the cached column count no longer covers the event.
    async fn table_info_for(&mut self, rows: &RowsEvent) -> Result<Arc<TableInfo>> {
        let schema = &rows.table.schema_name;
        let table = &rows.table.table_name;
        let key = table_key(schema, table);

        let mut ti = match self.tables.get(&key) {
            Some(ti) => ti.clone(),
            None => self.load_table(schema, table, rows).await?,
        };

        if (ti.columns.len() as u64) < rows.column_count {
            debug!(
                "table {key} metadata is stale ({} < {} columns), reloading",
                ti.columns.len(),
                rows.column_count
            );
            self.tables.remove(&key);
            ti = self.load_table(schema, table, rows).await?;
            if (ti.columns.len() as u64) < rows.column_count {
                return Err(SyncError::schema(format!(
                    "{key}: table has {} columns but the binlog event carries {}",
                    ti.columns.len(),
                    rows.column_count
                )));
            }
        }
        Ok(ti)
    }

    async fn load_table(
        &mut self,
        schema: &str,
        table: &str,
        rows: &RowsEvent,
    ) -> Result<Arc<TableInfo>> {
        let mut conn = self.metadata.get_conn().await?;
        let ti = Arc::new(load_table_info(&mut conn, schema, table, &rows.desc).await?);
        self.tables.insert(table_key(schema, table), ti.clone());
        Ok(ti)
    }

    async fn shutdown(mut self) {
        self.slave.stop().await;
        self.manager.stop().await;
        if let Err(e) = self.points.write_point(&self.slave.current_point()).await {
            error!("failed to record final replication point: {e}");
        }
        if let Err(e) = self.points.save().await {
            error!("failed to save checkpoint store: {e}");
        }
    }
}

/// Turn one rows event into worker events: one per row for insert/delete,
/// one per before/after pair for updates.
pub fn build_worker_events(
    header: &EventHeader,
    rows: &RowsEvent,
    ti: &Arc<TableInfo>,
    point: &crate::slave::ReplicationPoint,
) -> Result<Vec<WorkerEvent>> {
    let kind = match rows.action {
        RowAction::Insert => WorkerEventKind::Insert,
        RowAction::Update => WorkerEventKind::Update,
        RowAction::Delete => WorkerEventKind::Delete,
    };

    let mut jobs = Vec::with_capacity(rows.rows.len());
    let mut i = 0;
    while i < rows.rows.len() {
        let columns = fill_columns_with_values(ti, &rows.rows[i].columns);
        let new_columns = if rows.action == RowAction::Update {
            let after = rows.rows.get(i + 1).ok_or_else(|| {
                SyncError::protocol(format!(
                    "update event for {}.{} has an unpaired row",
                    ti.schema, ti.name
                ))
            })?;
            Some(fill_columns_with_values(ti, &after.columns))
        } else {
            None
        };

        jobs.push(WorkerEvent {
            kind,
            timestamp: header.timestamp,
            point: point.clone(),
            table: ti.clone(),
            columns,
            new_columns,
            desc: rows.desc.clone(),
        });

        i += if rows.action == RowAction::Update { 2 } else { 1 };
    }
    Ok(jobs)
}
