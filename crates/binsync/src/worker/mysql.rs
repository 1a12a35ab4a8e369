//! MySQL destination executor.
//!
//! Inserts are rewritten as `REPLACE INTO` so replayed batches after a
//! crash-restart stay idempotent for the partitioning key. Updates bind the
//! changed columns only; updates and deletes locate rows by the index
//! columns.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Params, Pool, Value};
use tracing::{info, warn};

use crate::binlog::ColumnValue;
use crate::error::{Result, SyncError};
use crate::protocol::DbConfig;
use crate::worker::{Executor, WorkerEvent, WorkerEventKind};

/// Rotate to the next backing connection once dial errors have persisted
/// this long.
const SWITCH_DB_INTERVAL: Duration = Duration::from_secs(30);

pub struct MySqlExecutor {
    pools: Vec<Pool>,
    inuse: usize,
    conn: Option<mysql_async::Conn>,
    in_txn: bool,
    first_dial_error: Option<Instant>,
}

impl Default for MySqlExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlExecutor {
    pub fn new() -> Self {
        Self {
            pools: Vec::new(),
            inuse: 0,
            conn: None,
            in_txn: false,
            first_dial_error: None,
        }
    }

    async fn connection(&mut self) -> Result<&mut mysql_async::Conn> {
        if self.conn.is_none() {
            let pool = self
                .pools
                .get(self.inuse)
                .ok_or_else(|| SyncError::invalid_state("executor has no attached db"))?;
            match pool.get_conn().await {
                Ok(conn) => {
                    self.first_dial_error = None;
                    self.conn = Some(conn);
                }
                Err(e) => {
                    self.note_dial_error();
                    return Err(SyncError::Executor(e));
                }
            }
        }
        self.conn
            .as_mut()
            .ok_or_else(|| SyncError::invalid_state("no destination connection"))
    }

    /// Track sustained dial failures and rotate the backing connection.
    fn note_dial_error(&mut self) {
        match self.first_dial_error {
            None => self.first_dial_error = Some(Instant::now()),
            Some(since) if since.elapsed() > SWITCH_DB_INTERVAL => {
                self.inuse = (self.inuse + 1) % self.pools.len().max(1);
                self.first_dial_error = None;
                if self.pools.len() > 1 {
                    warn!("switching destination db index to {} after sustained dial failures", self.inuse);
                }
            }
            Some(_) => {}
        }
    }

    /// Drop the connection after an I/O failure so the next begin redials.
    fn invalidate(&mut self) {
        self.conn = None;
        self.in_txn = false;
    }

    fn statement(job: &WorkerEvent) -> Result<(String, Params)> {
        match job.kind {
            WorkerEventKind::Insert => Self::insert_statement(job),
            WorkerEventKind::Update => Self::update_statement(job),
            WorkerEventKind::Delete => Self::delete_statement(job),
        }
    }

    fn insert_statement(job: &WorkerEvent) -> Result<(String, Params)> {
        let mut stmt = String::with_capacity(64);
        let mut values = Vec::with_capacity(job.columns.len());

        stmt.push_str("REPLACE INTO ");
        stmt.push_str(&target(job));
        stmt.push_str(" (");
        for (i, c) in job.columns.iter().enumerate() {
            if i != 0 {
                stmt.push_str(", ");
            }
            stmt.push('`');
            stmt.push_str(&c.column.name);
            stmt.push('`');
        }
        stmt.push_str(") VALUES (");
        for (i, c) in job.columns.iter().enumerate() {
            if i != 0 {
                stmt.push_str(", ");
            }
            stmt.push('?');
            values.push(bind_value(c.column.unsigned, &c.value));
        }
        stmt.push(')');
        Ok((stmt, Params::Positional(values)))
    }

    fn update_statement(job: &WorkerEvent) -> Result<(String, Params)> {
        let new_columns = job.new_columns.as_ref().ok_or_else(|| {
            SyncError::invalid_state("update event without an after-image")
        })?;

        let mut stmt = String::with_capacity(64);
        let mut values = Vec::new();

        stmt.push_str("UPDATE ");
        stmt.push_str(&target(job));
        stmt.push_str(" SET ");
        let mut set = 0;
        for (old, new) in job.columns.iter().zip(new_columns.iter()) {
            if old.value == new.value {
                continue;
            }
            if set != 0 {
                stmt.push_str(", ");
            }
            stmt.push('`');
            stmt.push_str(&new.column.name);
            stmt.push_str("` = ?");
            values.push(bind_value(new.column.unsigned, &new.value));
            set += 1;
        }
        if set == 0 {
            return Err(SyncError::schema(format!(
                "table {}.{} update without changed columns",
                job.table.schema, job.table.name
            )));
        }

        stmt.push_str(" WHERE ");
        let filtered = Self::push_key_filter(&mut stmt, &mut values, job)?;
        if filtered == 0 {
            return Err(SyncError::schema(format!(
                "table {}.{} has no index columns",
                job.table.schema, job.table.name
            )));
        }
        Ok((stmt, Params::Positional(values)))
    }

    fn delete_statement(job: &WorkerEvent) -> Result<(String, Params)> {
        let mut stmt = String::with_capacity(64);
        let mut values = Vec::new();

        stmt.push_str("DELETE FROM ");
        stmt.push_str(&target(job));
        stmt.push_str(" WHERE ");
        let filtered = Self::push_key_filter(&mut stmt, &mut values, job)?;
        if filtered == 0 {
            return Err(SyncError::schema(format!(
                "table {}.{} has no index columns",
                job.table.schema, job.table.name
            )));
        }
        Ok((stmt, Params::Positional(values)))
    }

    fn push_key_filter(
        stmt: &mut String,
        values: &mut Vec<Value>,
        job: &WorkerEvent,
    ) -> Result<usize> {
        let mut count = 0;
        for c in &job.columns {
            if !c.column.is_primary {
                continue;
            }
            if count != 0 {
                stmt.push_str(" AND ");
            }
            stmt.push('`');
            stmt.push_str(&c.column.name);
            stmt.push_str("` = ?");
            values.push(bind_value(c.column.unsigned, &c.value));
            count += 1;
        }
        Ok(count)
    }
}

fn target(job: &WorkerEvent) -> String {
    format!("`{}`.`{}`", job.desc.rewrite_schema, job.desc.rewrite_table)
}

fn bind_value(unsigned: bool, value: &ColumnValue) -> Value {
    let value = if unsigned {
        value.clone().into_unsigned()
    } else {
        value.clone()
    };
    match value {
        ColumnValue::Null => Value::NULL,
        ColumnValue::Int8(v) => Value::Int(i64::from(v)),
        ColumnValue::Int16(v) => Value::Int(i64::from(v)),
        ColumnValue::Int32(v) => Value::Int(i64::from(v)),
        ColumnValue::Int64(v) => Value::Int(v),
        ColumnValue::UInt8(v) => Value::UInt(u64::from(v)),
        ColumnValue::UInt16(v) => Value::UInt(u64::from(v)),
        ColumnValue::UInt32(v) => Value::UInt(u64::from(v)),
        ColumnValue::UInt64(v) => Value::UInt(v),
        ColumnValue::Float(v) => Value::Float(v),
        ColumnValue::Double(v) => Value::Double(v),
        ColumnValue::String(v) => Value::Bytes(v.into_bytes()),
        ColumnValue::Bytes(v) => Value::Bytes(v),
        ColumnValue::Decimal(v) => Value::Bytes(v.into_bytes()),
    }
}

#[async_trait]
impl Executor for MySqlExecutor {
    async fn attach(&mut self, dbs: &[DbConfig]) -> Result<()> {
        if self.in_txn {
            return Err(SyncError::invalid_state(
                "cannot attach while a transaction is open",
            ));
        }
        if dbs.is_empty() {
            return Err(SyncError::config("mysql destination has no dbs"));
        }

        let mut pools = Vec::with_capacity(dbs.len());
        for db in dbs {
            let opts: Opts = OptsBuilder::default()
                .ip_or_hostname(db.host.clone())
                .tcp_port(db.port)
                .user(Some(db.username.clone()))
                .pass(Some(db.password.clone()))
                .into();
            pools.push(Pool::new(opts));
        }
        info!("mysql executor attached to {} destination db(s)", pools.len());

        self.pools = pools;
        self.inuse = 0;
        self.conn = None;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(SyncError::invalid_state("transaction already open"));
        }
        let conn = self.connection().await?;
        if let Err(e) = conn.query_drop("BEGIN").await {
            self.invalidate();
            return Err(SyncError::Executor(e));
        }
        self.in_txn = true;
        Ok(())
    }

    async fn exec(&mut self, job: &WorkerEvent) -> Result<()> {
        if !self.in_txn {
            return Err(SyncError::invalid_state("exec outside a transaction"));
        }
        let (stmt, params) = Self::statement(job)?;
        let conn = self.connection().await?;
        if let Err(e) = conn.exec_drop(stmt, params).await {
            self.invalidate();
            return Err(SyncError::Executor(e));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Ok(());
        }
        self.in_txn = false;
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.query_drop("ROLLBACK").await {
                self.invalidate();
                return Err(SyncError::Executor(e));
            }
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(SyncError::invalid_state("commit outside a transaction"));
        }
        let conn = self.connection().await?;
        match conn.query_drop("COMMIT").await {
            Ok(()) => {
                self.in_txn = false;
                Ok(())
            }
            Err(e) => {
                self.invalidate();
                Err(SyncError::Executor(e))
            }
        }
    }
}
