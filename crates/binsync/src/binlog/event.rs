//! Event header, event types and the non-row payload decoders.

use std::sync::Arc;

use crate::codec::BinReader;
use crate::error::Result;
use crate::binlog::rows::RowsEvent;
use crate::binlog::table_map::TableMapEvent;

/// Binlog event types.
///
/// <https://dev.mysql.com/doc/internals/en/binlog-event-type.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Unknown = 0,
    StartV3 = 1,
    Query = 2,
    Stop = 3,
    Rotate = 4,
    Intvar = 5,
    Load = 6,
    Slave = 7,
    CreateFile = 8,
    AppendBlock = 9,
    ExecLoad = 10,
    DeleteFile = 11,
    NewLoad = 12,
    Rand = 13,
    UserVar = 14,
    FormatDescription = 15,
    Xid = 16,
    BeginLoadQuery = 17,
    ExecuteLoadQuery = 18,
    TableMap = 19,
    WriteRowsV0 = 20,
    UpdateRowsV0 = 21,
    DeleteRowsV0 = 22,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Incident = 26,
    Heartbeat = 27,
    Ignorable = 28,
    RowsQuery = 29,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
    Gtid = 33,
    AnonymousGtid = 34,
    PreviousGtids = 35,
    // MariaDB private event range.
    MariadbAnnotateRows = 160,
    MariadbBinlogCheckpoint = 161,
    MariadbGtid = 162,
    MariadbGtidList = 163,
}

impl EventType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::StartV3,
            2 => Self::Query,
            3 => Self::Stop,
            4 => Self::Rotate,
            5 => Self::Intvar,
            6 => Self::Load,
            7 => Self::Slave,
            8 => Self::CreateFile,
            9 => Self::AppendBlock,
            10 => Self::ExecLoad,
            11 => Self::DeleteFile,
            12 => Self::NewLoad,
            13 => Self::Rand,
            14 => Self::UserVar,
            15 => Self::FormatDescription,
            16 => Self::Xid,
            17 => Self::BeginLoadQuery,
            18 => Self::ExecuteLoadQuery,
            19 => Self::TableMap,
            20 => Self::WriteRowsV0,
            21 => Self::UpdateRowsV0,
            22 => Self::DeleteRowsV0,
            23 => Self::WriteRowsV1,
            24 => Self::UpdateRowsV1,
            25 => Self::DeleteRowsV1,
            26 => Self::Incident,
            27 => Self::Heartbeat,
            28 => Self::Ignorable,
            29 => Self::RowsQuery,
            30 => Self::WriteRowsV2,
            31 => Self::UpdateRowsV2,
            32 => Self::DeleteRowsV2,
            33 => Self::Gtid,
            34 => Self::AnonymousGtid,
            35 => Self::PreviousGtids,
            160 => Self::MariadbAnnotateRows,
            161 => Self::MariadbBinlogCheckpoint,
            162 => Self::MariadbGtid,
            163 => Self::MariadbGtidList,
            _ => Self::Unknown,
        }
    }

    pub fn is_rows_event(&self) -> bool {
        matches!(
            self,
            Self::WriteRowsV0
                | Self::UpdateRowsV0
                | Self::DeleteRowsV0
                | Self::WriteRowsV1
                | Self::UpdateRowsV1
                | Self::DeleteRowsV1
                | Self::WriteRowsV2
                | Self::UpdateRowsV2
                | Self::DeleteRowsV2
        )
    }
}

/// The fixed 19-byte little-endian event header.
///
/// <https://dev.mysql.com/doc/internals/en/binlog-event-header.html>
#[derive(Debug, Clone, Default)]
pub struct EventHeader {
    /// Seconds since the unix epoch.
    pub timestamp: u32,
    pub event_type: u8,
    /// server-id of the originating server, used to filter events in
    /// circular replication.
    pub server_id: u32,
    /// Size of the event including this header.
    pub event_size: u32,
    /// Position of the next event.
    pub log_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn decode(r: &mut BinReader<'_>) -> Result<Self> {
        Ok(Self {
            timestamp: r.read_u32()?,
            event_type: r.read_u8()?,
            server_id: r.read_u32()?,
            event_size: r.read_u32()?,
            log_pos: r.read_u32()?,
            flags: r.read_u16()?,
        })
    }

    pub fn kind(&self) -> EventType {
        EventType::from_u8(self.event_type)
    }
}

/// One decoded binlog event: the common header plus a tagged payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub header: EventHeader,
    pub payload: BinlogEvent,
}

/// Payloads of the event types this slave decodes. Other types are
/// acknowledged and carried as [`BinlogEvent::Skipped`].
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription(FormatDescriptionEvent),
    Rotate(RotateEvent),
    Query(QueryEvent),
    Xid(XidEvent),
    TableMap(Arc<TableMapEvent>),
    Rows(RowsEvent),
    RowsQuery(RowsQueryEvent),
    Gtid(GtidEvent),
    MariadbGtid(MariadbGtidEvent),
    Heartbeat(HeartbeatEvent),
    /// Undecoded or rule-filtered event.
    Skipped(EventType),
}

/// The first event of a binlog-version-4 stream; declares per-event-type
/// header lengths required for all subsequent row-event parsing.
#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
    pub create_timestamp: u32,
    pub event_header_length: u8,
    pub event_type_header_lengths: Vec<u8>,
}

impl FormatDescriptionEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        let binlog_version = r.read_u16()?;
        let server_version = {
            let raw = r.read_bytes(50)?;
            String::from_utf8_lossy(raw)
                .trim_end_matches('\0')
                .to_string()
        };
        let create_timestamp = r.read_u32()?;
        let event_header_length = r.read_u8()?;
        let event_type_header_lengths = r.rest().to_vec();

        Ok(Self {
            binlog_version,
            server_version,
            create_timestamp,
            event_header_length,
            event_type_header_lengths,
        })
    }
}

/// <https://dev.mysql.com/doc/internals/en/rotate-event.html>
#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_name: String,
}

impl RotateEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        Ok(Self {
            position: r.read_u64()?,
            next_name: r.read_string_eof()?,
        })
    }
}

/// <https://dev.mysql.com/doc/internals/en/query-event.html>
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub slave_proxy_id: u32,
    pub execution_time: u32,
    pub error_code: u16,
    pub status_vars: Vec<u8>,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        let slave_proxy_id = r.read_u32()?;
        let execution_time = r.read_u32()?;
        let schema_length = r.read_u8()?;
        let error_code = r.read_u16()?;
        let status_vars_length = r.read_u16()?;

        let status_vars = r.read_bytes(status_vars_length as usize)?.to_vec();
        let schema = r.read_string_fixed(schema_length as usize)?;
        // Pad byte.
        r.read_u8()?;
        let query = r.read_string_eof()?;

        Ok(Self {
            slave_proxy_id,
            execution_time,
            error_code,
            status_vars,
            schema,
            query,
        })
    }
}

/// Transaction commit marker on the source side.
///
/// <https://dev.mysql.com/doc/internals/en/xid-event.html>
#[derive(Debug, Clone)]
pub struct XidEvent {
    pub xid: u64,
}

impl XidEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        Ok(Self { xid: r.read_u64()? })
    }
}

/// The statement text preceding its rows events when `binlog_rows_query_log_events`
/// is enabled.
#[derive(Debug, Clone)]
pub struct RowsQueryEvent {
    pub query: String,
}

impl RowsQueryEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        // 1-byte length, ignored: the text runs to the end of the event.
        r.read_u8()?;
        Ok(Self {
            query: r.read_string_eof()?,
        })
    }
}

/// GTID of the following transaction (MySQL flavor).
#[derive(Debug, Clone)]
pub struct GtidEvent {
    pub commit_flag: u8,
    pub sid: [u8; 16],
    pub gno: i64,
}

impl GtidEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        let commit_flag = r.read_u8()?;
        let mut sid = [0u8; 16];
        sid.copy_from_slice(r.read_bytes(16)?);
        let gno = r.read_i64()?;
        Ok(Self {
            commit_flag,
            sid,
            gno,
        })
    }

    pub fn uuid_string(&self) -> String {
        let s = &self.sid;
        format!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7],
            s[8], s[9], s[10], s[11], s[12], s[13], s[14], s[15]
        )
    }

    pub fn gtid_string(&self) -> String {
        format!("{}:{}", self.uuid_string(), self.gno)
    }
}

/// GTID of the following transaction (MariaDB flavor). The server id is
/// copied out of the event header.
#[derive(Debug, Clone)]
pub struct MariadbGtidEvent {
    pub domain_id: u32,
    pub server_id: u32,
    pub sequence_number: u32,
}

impl MariadbGtidEvent {
    pub fn decode(data: &[u8], server_id: u32) -> Result<Self> {
        let mut r = BinReader::new(data);
        let sequence_number = r.read_u32()?;
        let domain_id = r.read_u32()?;
        Ok(Self {
            domain_id,
            server_id,
            sequence_number,
        })
    }

    pub fn gtid_string(&self) -> String {
        format!(
            "{}-{}-{}",
            self.domain_id, self.server_id, self.sequence_number
        )
    }
}

/// Sent by the primary when no binlog is produced within the heartbeat
/// period. Does not advance the replication point.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub log_ident: String,
}

impl HeartbeatEvent {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        Ok(Self {
            log_ident: r.read_string_eof()?,
        })
    }
}
