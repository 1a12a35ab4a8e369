//! Engine internals: startup negotiation, the pump task and reconnect
//! handling.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::binlog::{BinlogEvent, ChecksumAlg, Event, Parser};
use crate::error::{Result, SyncError};
use crate::protocol::{Conn, DataSource, QueryResponse};
use crate::protocol::{PACKET_HEADER_EOF, PACKET_HEADER_ERR, PACKET_HEADER_OK};
use crate::protocol::ErrPacket;
use crate::protocol::CapabilityFlags;
use crate::rule::SyncRule;
use crate::slave::{ReplicationConfig, ReplicationPoint};

pub(crate) const DEFAULT_EVENT_BUFFER_SIZE: usize = 10240;
const ERROR_CHANNEL_SIZE: usize = 16;
/// Heartbeats are requested at this interval; the read deadline is 1.5x.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Consecutive failed reconnects before rotating to the next data source.
const SWITCH_SOURCE_RETRY_TIMES: u64 = 30;
/// Binlog events start at offset 4, after the magic bytes.
const MIN_BINLOG_OFFSET: u32 = 4;

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum SlaveStatus {
    None = 0,
    Running = 1,
    Exited = 2,
    Abnormal = 3,
}

impl SlaveStatus {
    fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Exited,
            3 => Self::Abnormal,
            _ => Self::None,
        }
    }
}

/// A slave node participating in MySQL replication.
pub struct Slave {
    dss: Arc<Vec<DataSource>>,
    dsi: Arc<AtomicUsize>,
    rc: ReplicationConfig,
    rule: Arc<SyncRule>,
    status: Arc<AtomicI64>,
    point: Arc<Mutex<ReplicationPoint>>,
    last_heartbeat: Arc<AtomicU64>,
    cancel: CancellationToken,
    event_rx: mpsc::Receiver<Event>,
    event_tx: Option<mpsc::Sender<Event>>,
    error_rx: mpsc::Receiver<SyncError>,
    error_tx: Option<mpsc::Sender<SyncError>>,
    pump: Option<JoinHandle<()>>,
}

impl Slave {
    pub fn new(dss: Vec<DataSource>, rc: ReplicationConfig, rule: Arc<SyncRule>) -> Self {
        let buffer = if rc.event_buffer_size == 0 {
            DEFAULT_EVENT_BUFFER_SIZE
        } else {
            rc.event_buffer_size
        };
        let (event_tx, event_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_SIZE);

        Self {
            dss: Arc::new(dss),
            dsi: Arc::new(AtomicUsize::new(0)),
            rc,
            rule,
            status: Arc::new(AtomicI64::new(SlaveStatus::None as i64)),
            point: Arc::new(Mutex::new(ReplicationPoint::default())),
            last_heartbeat: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
            event_rx,
            event_tx: Some(event_tx),
            error_rx,
            error_tx: Some(error_tx),
            pump: None,
        }
    }

    pub fn status(&self) -> SlaveStatus {
        SlaveStatus::from_i64(self.status.load(Ordering::SeqCst))
    }

    /// The engine's current replication point, updated by the pump.
    pub fn current_point(&self) -> ReplicationPoint {
        self.point.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Index of the data source currently in use.
    pub fn data_source_index(&self) -> usize {
        self.dsi.load(Ordering::SeqCst) % self.dss.len().max(1)
    }

    pub fn data_source(&self) -> &DataSource {
        &self.dss[self.data_source_index()]
    }

    /// Unix timestamp of the last heartbeat received from the primary.
    pub fn last_heartbeat(&self) -> u64 {
        self.last_heartbeat.load(Ordering::SeqCst)
    }

    /// Connect, negotiate and start pumping the binlog from `point`.
    pub fn validate(&self) -> Result<()> {
        if self.dss.is_empty() {
            return Err(SyncError::config("empty data source list"));
        }
        if self.rc.slave_id == 0 {
            return Err(SyncError::config("replication.slave-id must be non-zero"));
        }
        Ok(())
    }

    pub async fn start(&mut self, point: ReplicationPoint) -> Result<()> {
        if self.status() != SlaveStatus::None {
            return Err(SyncError::invalid_state("slave already started"));
        }
        self.validate()?;

        {
            let mut current = self.point.lock().unwrap_or_else(|e| e.into_inner());
            *current = point;
            if current.offset < MIN_BINLOG_OFFSET {
                // Events begin at position 4 with the format description.
                current.offset = MIN_BINLOG_OFFSET;
            }
            info!("start sync from {current}");
        }

        let mut parser = Parser::new();
        parser.set_sync_rule(self.rule.clone());

        let ctx = PumpContext {
            dss: self.dss.clone(),
            dsi: self.dsi.clone(),
            rc: self.rc.clone(),
            point: self.point.clone(),
            last_heartbeat: self.last_heartbeat.clone(),
            status: self.status.clone(),
            cancel: self.cancel.clone(),
        };

        // Fail fast on a bad first connection: authentication and
        // configuration errors surface from Start instead of the queue.
        let conn = ctx.prepare(&mut parser).await?;

        self.status
            .store(SlaveStatus::Running as i64, Ordering::SeqCst);

        let event_tx = self
            .event_tx
            .take()
            .ok_or_else(|| SyncError::invalid_state("slave already consumed"))?;
        let error_tx = self
            .error_tx
            .take()
            .ok_or_else(|| SyncError::invalid_state("slave already consumed"))?;
        self.pump = Some(tokio::spawn(pump_binlog(
            ctx, conn, parser, event_tx, error_tx,
        )));

        Ok(())
    }

    /// Stop the engine and wait for the pump to exit.
    pub async fn stop(&mut self) {
        if self.status() != SlaveStatus::Running {
            return;
        }
        self.status
            .store(SlaveStatus::Exited as i64, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }

    /// The next decoded event, an error, or cancellation.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Result<Event> {
        if self.status() != SlaveStatus::Running {
            return Err(SyncError::invalid_state("slave not running"));
        }
        tokio::select! {
            ev = self.event_rx.recv() => ev.ok_or(SyncError::ConnectionClosed),
            err = self.error_rx.recv() => Err(err.unwrap_or(SyncError::ConnectionClosed)),
            _ = cancel.cancelled() => Err(SyncError::UserClosed),
        }
    }
}

/// Everything the pump task needs, bundled so reconnects can re-run the
/// startup sequence.
struct PumpContext {
    dss: Arc<Vec<DataSource>>,
    dsi: Arc<AtomicUsize>,
    rc: ReplicationConfig,
    point: Arc<Mutex<ReplicationPoint>>,
    last_heartbeat: Arc<AtomicU64>,
    status: Arc<AtomicI64>,
    cancel: CancellationToken,
}

impl PumpContext {
    fn data_source(&self) -> &DataSource {
        &self.dss[self.dsi.load(Ordering::SeqCst) % self.dss.len()]
    }

    fn next_data_source(&self) {
        self.dsi.fetch_add(1, Ordering::SeqCst);
    }

    fn point(&self) -> ReplicationPoint {
        self.point.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run the full startup sequence against the current data source and
    /// return a connection with the dump running.
    async fn prepare(&self, parser: &mut Parser) -> Result<Conn> {
        let ds = self.data_source().clone();
        let mut conn = Conn::connect(&ds, "").await?;

        let mariadb = conn
            .handshake_info()
            .server_version
            .to_uppercase()
            .contains("MARIADB");
        if self.rc.enable_gtid && !mariadb {
            return Err(SyncError::config(
                "replication.enable-gtid requires a MariaDB primary",
            ));
        }

        if self.rc.keepalive_period != 0 {
            match conn.set_keepalive(Duration::from_secs(self.rc.keepalive_period)) {
                Ok(()) => info!(
                    "enabled tcp keepalive with period {}s",
                    self.rc.keepalive_period
                ),
                Err(e) => warn!("failed to enable tcp keepalive: {e}"),
            }
        }

        self.negotiate_checksum(&mut conn, parser).await?;
        self.enable_heartbeat(&mut conn).await?;

        if mariadb {
            // Announce slave capabilities so MariaDB 10.x sends a stream we
            // can parse.
            conn.exec("SET @mariadb_slave_capability=4").await?;
        }

        conn.register_slave(&self.rc, &ds).await?;

        let mut point = self.point();
        if point.offset < MIN_BINLOG_OFFSET {
            point.offset = MIN_BINLOG_OFFSET;
        }
        conn.start_dump_binlog(&point, self.rc.slave_id).await?;

        Ok(conn)
    }

    /// Adopt the primary's binlog checksum setting and mirror it in the
    /// parser so event trailers are trimmed.
    async fn negotiate_checksum(&self, conn: &mut Conn, parser: &mut Parser) -> Result<()> {
        conn.exec("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        let response = conn.exec("SELECT @master_binlog_checksum").await?;
        if let QueryResponse::Rows(rs) = response {
            if let Some(checksum) = rs.value_at(0, 0) {
                if checksum.eq_ignore_ascii_case("CRC32") {
                    parser.set_checksum(ChecksumAlg::Crc32);
                    debug!("binlog checksum negotiated: CRC32");
                }
            }
        }
        Ok(())
    }

    /// Ask for heartbeats and arm the read deadline so a silent primary
    /// surfaces as a timeout.
    async fn enable_heartbeat(&self, conn: &mut Conn) -> Result<()> {
        let nanos = HEARTBEAT_INTERVAL_SECS * 1_000_000_000;
        conn.exec(&format!("SET @master_heartbeat_period = {nanos}"))
            .await?;
        conn.set_read_timeout(Some(Duration::from_secs(HEARTBEAT_INTERVAL_SECS * 3 / 2)));
        Ok(())
    }

    /// Reconnect with 1s backoff, rotating the data source every
    /// [`SWITCH_SOURCE_RETRY_TIMES`] consecutive failures.
    async fn reconnect(&self, parser: &mut Parser) -> Result<Conn> {
        let mut retry_times = 0u64;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::UserClosed),
                _ = sleep(RECONNECT_BACKOFF) => {}
            }

            let point = self.point();
            if point.filename.is_empty() && !self.rc.enable_gtid {
                // GTID mode tolerates an empty set; position mode cannot
                // resume without a filename.
                return Err(SyncError::invalid_state(format!(
                    "cannot retry sync with invalid position {point}"
                )));
            }

            info!("retry sync from {point}");
            parser.reset();
            match self.prepare(parser).await {
                Ok(conn) => return Ok(conn),
                Err(e) if !e.is_retriable() => return Err(e),
                Err(e) => {
                    retry_times += 1;
                    error!("retry sync error: {e}, retry times {retry_times}");
                    if retry_times % SWITCH_SOURCE_RETRY_TIMES == 0 {
                        info!("selecting next data source, current primary looks down");
                        self.next_data_source();
                    }
                }
            }
        }
    }
}

/// Apply the post-decode hooks to the replication point.
///
/// Every event with a non-zero `log_pos` advances the offset; rotate
/// replaces the filename first, then the offset. Heartbeats refresh the
/// liveness clock only and never move the point.
pub(crate) fn advance_point(point: &mut ReplicationPoint, event: &Event) -> bool {
    if let BinlogEvent::Heartbeat(_) = event.payload {
        return false;
    }
    if event.header.log_pos > 0 {
        point.offset = event.header.log_pos;
    }
    match &event.payload {
        BinlogEvent::Rotate(rotate) => {
            point.filename = rotate.next_name.clone();
            point.offset = rotate.position as u32;
            info!("rotate to {point}");
        }
        BinlogEvent::MariadbGtid(gtid) => {
            point.gtid = gtid.gtid_string();
        }
        _ => {}
    }
    true
}

async fn pump_binlog(
    ctx: PumpContext,
    mut conn: Conn,
    mut parser: Parser,
    event_tx: mpsc::Sender<Event>,
    error_tx: mpsc::Sender<SyncError>,
) {
    let push_error = |err: SyncError| {
        // Full error channel: the consumer already has a terminal error.
        let _ = error_tx.try_send(err);
    };

    loop {
        let data = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                ctx.status.store(SlaveStatus::Exited as i64, Ordering::SeqCst);
                push_error(SyncError::UserClosed);
                return;
            }
            res = conn.read_packet() => match res {
                Ok(data) => data,
                Err(e) => {
                    error!("read packet from primary failed: {e}");
                    match ctx.reconnect(&mut parser).await {
                        Ok(new_conn) => {
                            conn = new_conn;
                            info!("retry sync at {} success", ctx.point());
                            continue;
                        }
                        Err(e) => {
                            let terminal = if matches!(e, SyncError::UserClosed) {
                                SlaveStatus::Exited
                            } else {
                                SlaveStatus::Abnormal
                            };
                            ctx.status.store(terminal as i64, Ordering::SeqCst);
                            push_error(e);
                            return;
                        }
                    }
                }
            }
        };

        match data.first() {
            Some(&PACKET_HEADER_ERR) => {
                let err = match ErrPacket::decode(
                    &data,
                    CapabilityFlags::new(CapabilityFlags::CLIENT_PROTOCOL_41),
                ) {
                    Ok(p) => p.into_error(),
                    Err(e) => e,
                };
                ctx.status
                    .store(SlaveStatus::Abnormal as i64, Ordering::SeqCst);
                push_error(err);
                return;
            }
            Some(&PACKET_HEADER_EOF) => continue,
            Some(&PACKET_HEADER_OK) => {
                let event = match parser.parse(&data) {
                    Ok(ev) => ev,
                    Err(e) => {
                        ctx.status
                            .store(SlaveStatus::Abnormal as i64, Ordering::SeqCst);
                        push_error(e);
                        return;
                    }
                };

                if let BinlogEvent::Heartbeat(_) = event.payload {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or_default();
                    ctx.last_heartbeat.store(now, Ordering::SeqCst);
                }

                {
                    let mut point = ctx.point.lock().unwrap_or_else(|e| e.into_inner());
                    advance_point(&mut point, &event);
                }

                if matches!(event.payload, BinlogEvent::Skipped(_)) {
                    continue;
                }

                // Bounded channel: a full queue blocks here and
                // backpressures the primary.
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        ctx.status.store(SlaveStatus::Exited as i64, Ordering::SeqCst);
                        push_error(SyncError::UserClosed);
                        return;
                    }
                    res = event_tx.send(event) => {
                        if res.is_err() {
                            debug!("event consumer dropped, pump exiting");
                            ctx.status.store(SlaveStatus::Exited as i64, Ordering::SeqCst);
                            return;
                        }
                    }
                }
            }
            other => {
                ctx.status
                    .store(SlaveStatus::Abnormal as i64, Ordering::SeqCst);
                push_error(SyncError::protocol(format!(
                    "unknown binlog packet header {other:?}"
                )));
                return;
            }
        }
    }
}
