//! Shared fixtures and doubles for the integration tests.

// Each test binary compiles its own view of this module; not every binary
// uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use binsync::error::Result;
use binsync::protocol::DbConfig;
use binsync::worker::{Executor, SharedExecutor, WorkerEvent, WorkerEventKind};

/// Wire tracing output into the test harness; safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Records every batch an executor sees.
#[derive(Default)]
pub struct ExecutionLog {
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    /// `(kind, stringified column values, point offset)` per committed
    /// event.
    pub committed: Vec<(WorkerEventKind, Vec<String>, u32)>,
}

#[derive(Default)]
pub struct RecordingExecutor {
    log: Arc<Mutex<ExecutionLog>>,
    staged: Vec<(WorkerEventKind, Vec<String>, u32)>,
    /// Fail the first `fail_execs` exec calls.
    pub fail_execs: usize,
}

impl RecordingExecutor {
    pub fn shared() -> (SharedExecutor, Arc<Mutex<ExecutionLog>>) {
        let log = Arc::new(Mutex::new(ExecutionLog::default()));
        let executor = RecordingExecutor {
            log: log.clone(),
            ..RecordingExecutor::default()
        };
        (
            Arc::new(Mutex::new(Box::new(executor) as Box<dyn Executor>)),
            log,
        )
    }

    pub fn flaky(fail_execs: usize) -> (SharedExecutor, Arc<Mutex<ExecutionLog>>) {
        let log = Arc::new(Mutex::new(ExecutionLog::default()));
        let executor = RecordingExecutor {
            log: log.clone(),
            staged: Vec::new(),
            fail_execs,
        };
        (
            Arc::new(Mutex::new(Box::new(executor) as Box<dyn Executor>)),
            log,
        )
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn attach(&mut self, _dbs: &[DbConfig]) -> Result<()> {
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.log.lock().await.begins += 1;
        self.staged.clear();
        Ok(())
    }

    async fn exec(&mut self, job: &WorkerEvent) -> Result<()> {
        if self.fail_execs > 0 {
            self.fail_execs -= 1;
            return Err(binsync::SyncError::Io(std::io::Error::other(
                "injected exec failure",
            )));
        }
        let values = job.columns.iter().map(|c| c.value_text()).collect();
        self.staged.push((job.kind, values, job.point.offset));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.log.lock().await.rollbacks += 1;
        self.staged.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut log = self.log.lock().await;
        log.commits += 1;
        log.committed.append(&mut self.staged);
        Ok(())
    }
}

pub mod fixtures {
    use std::sync::Arc;

    use binsync::binlog::{EventType, ROWS_EVENT_FLAG_STMT_END};
    use binsync::codec::BinWriter;
    use binsync::protocol::ColumnType;
    use binsync::tableinfo::{ColumnInfo, TableInfo};

    const EVENT_HEADER_SIZE: usize = 19;

    /// Wrap an event body into a full dump-stream packet: the OK byte, the
    /// 19-byte header, the body and (optionally) a CRC32 trailer.
    pub fn event_packet(event_type: EventType, log_pos: u32, body: &[u8], crc: bool) -> Vec<u8> {
        let trailer = if crc {
            if event_type == EventType::FormatDescription {
                5
            } else {
                4
            }
        } else {
            0
        };
        let mut out = vec![0u8];
        let mut w = BinWriter::new();
        w.put_u32(1_600_000_000);
        w.put_u8(event_type as u8);
        w.put_u32(1);
        w.put_u32((EVENT_HEADER_SIZE + body.len() + trailer) as u32);
        w.put_u32(log_pos);
        w.put_u16(0);
        out.extend_from_slice(w.as_slice());
        out.extend_from_slice(body);
        out.extend_from_slice(&vec![0xCC; trailer]);
        out
    }

    pub fn format_description_packet(crc: bool) -> Vec<u8> {
        let mut w = BinWriter::new();
        w.put_u16(4);
        let mut version = [0u8; 50];
        version[..10].copy_from_slice(b"5.7.30-log");
        w.put_bytes(&version);
        w.put_u32(0);
        w.put_u8(19);
        let mut lengths = vec![0u8; 35];
        lengths[EventType::TableMap as usize - 1] = 8;
        for t in [
            EventType::WriteRowsV2,
            EventType::UpdateRowsV2,
            EventType::DeleteRowsV2,
        ] {
            lengths[t as usize - 1] = 10;
        }
        w.put_bytes(&lengths);
        event_packet(EventType::FormatDescription, 123, w.as_slice(), crc)
    }

    /// A two-column `[INT, VARCHAR(64)]` table map.
    pub fn table_map_packet(table_id: u64, schema: &str, table: &str, crc: bool) -> Vec<u8> {
        let mut w = BinWriter::new();
        w.put_u32(table_id as u32);
        w.put_u16((table_id >> 32) as u16);
        w.put_u16(0);
        w.put_len_string(schema);
        w.put_u8(0);
        w.put_len_string(table);
        w.put_u8(0);
        w.put_lenenc_int(2);
        w.put_bytes(&[ColumnType::Long as u8, ColumnType::Varchar as u8]);
        let mut meta = BinWriter::new();
        meta.put_u16(64);
        w.put_lenenc_int(meta.len() as u64);
        w.put_bytes(meta.as_slice());
        w.put_u8(0);
        event_packet(EventType::TableMap, 200, w.as_slice(), crc)
    }

    pub fn write_rows_packet(table_id: u64, id: i32, name: &str, crc: bool) -> Vec<u8> {
        let mut w = BinWriter::new();
        w.put_u32(table_id as u32);
        w.put_u16((table_id >> 32) as u16);
        w.put_u16(ROWS_EVENT_FLAG_STMT_END);
        w.put_u16(2);
        w.put_lenenc_int(2);
        w.put_u8(0b11);
        put_row(&mut w, id, name);
        event_packet(EventType::WriteRowsV2, 300, w.as_slice(), crc)
    }

    pub fn update_rows_packet(table_id: u64, before: (i32, &str), after: (i32, &str)) -> Vec<u8> {
        let mut w = BinWriter::new();
        w.put_u32(table_id as u32);
        w.put_u16((table_id >> 32) as u16);
        w.put_u16(ROWS_EVENT_FLAG_STMT_END);
        w.put_u16(2);
        w.put_lenenc_int(2);
        w.put_u8(0b11);
        w.put_u8(0b11);
        put_row(&mut w, before.0, before.1);
        put_row(&mut w, after.0, after.1);
        event_packet(EventType::UpdateRowsV2, 340, w.as_slice(), false)
    }

    fn put_row(w: &mut BinWriter, id: i32, name: &str) {
        w.put_u8(0); // null bitmap
        w.put_u32(id as u32);
        w.put_u8(name.len() as u8);
        w.put_string_eof(name);
    }

    /// Metadata matching the fixture table: `d.t (id INT PRIMARY KEY, name
    /// VARCHAR(64))`.
    pub fn table_info() -> Arc<TableInfo> {
        Arc::new(TableInfo {
            schema: "d".into(),
            name: "t".into(),
            columns: vec![
                ColumnInfo {
                    index: 0,
                    name: "id".into(),
                    column_type: "int(11)".into(),
                    is_primary: true,
                    ..ColumnInfo::default()
                },
                ColumnInfo {
                    index: 1,
                    name: "name".into(),
                    column_type: "varchar(64)".into(),
                    ..ColumnInfo::default()
                },
            ],
            index_columns: vec![0],
        })
    }
}
