//! The stateful event parser.
//!
//! Holds the per-stream state: the active format description, the
//! short-lived `table_id -> TableMapEvent` map and the negotiated checksum
//! algorithm. Rows events are filtered against the sync rule before their
//! row images are decoded, so excluded tables cost almost nothing.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::binlog::event::{
    BinlogEvent, Event, EventHeader, EventType, FormatDescriptionEvent, GtidEvent,
    HeartbeatEvent, MariadbGtidEvent, QueryEvent, RotateEvent, RowsQueryEvent, XidEvent,
};
use crate::binlog::rows::{RowAction, RowsEvent, ROWS_EVENT_FLAG_STMT_END};
use crate::binlog::table_map::TableMapEvent;
use crate::codec::BinReader;
use crate::error::{Result, SyncError};
use crate::rule::{SyncDesc, SyncRule};

/// A dummy rows event with this table id declares that all table maps can
/// be freed.
const DUMMY_TABLE_ID: u64 = 0x00FF_FFFF;

/// Binlog checksum algorithm negotiated with the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlg {
    #[default]
    Off,
    Crc32,
}

/// Parses the packets of a binlog dump stream into [`Event`]s.
pub struct Parser {
    tables: HashMap<u64, Arc<TableMapEvent>>,
    format: Option<FormatDescriptionEvent>,
    checksum: ChecksumAlg,
    rule: Option<Arc<SyncRule>>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            tables: HashMap::new(),
            format: None,
            checksum: ChecksumAlg::Off,
            rule: None,
        }
    }

    /// Reset the per-stream state before a resume. The checksum is
    /// re-negotiated on reconnect and the format description is resent by
    /// the primary.
    pub fn reset(&mut self) {
        self.checksum = ChecksumAlg::Off;
        self.format = None;
        self.tables.clear();
    }

    pub fn set_checksum(&mut self, alg: ChecksumAlg) {
        self.checksum = alg;
    }

    pub fn checksum(&self) -> ChecksumAlg {
        self.checksum
    }

    /// Attach the sync rule. Only rows events are filtered; DDL statements
    /// in query events are not affected.
    pub fn set_sync_rule(&mut self, rule: Arc<SyncRule>) {
        self.rule = Some(rule);
    }

    pub fn table(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    /// Parse one network packet carrying a binlog event. `data[0]` is the
    /// OK byte of the packet.
    pub fn parse(&mut self, data: &[u8]) -> Result<Event> {
        if data.is_empty() {
            return Err(SyncError::Overflow);
        }
        let data = &data[1..];

        let mut r = BinReader::new(data);
        let header = EventHeader::decode(&mut r)?;
        let mut body = r.rest();

        // CRC32 streams carry 4 trailing checksum bytes per event; format
        // description events additionally carry the checksum-algorithm
        // marker byte before them.
        if self.checksum == ChecksumAlg::Crc32 {
            let mut trim = 4;
            if header.kind() == EventType::FormatDescription {
                trim += 1;
            }
            if body.len() < trim {
                return Err(SyncError::Overflow);
            }
            body = &body[..body.len() - trim];
        }

        let payload = self.parse_payload(&header, body)?;
        Ok(Event { header, payload })
    }

    fn parse_payload(&mut self, header: &EventHeader, body: &[u8]) -> Result<BinlogEvent> {
        match header.kind() {
            EventType::FormatDescription => {
                let fd = FormatDescriptionEvent::decode(body)?;
                let payload = BinlogEvent::FormatDescription(fd.clone());
                self.format = Some(fd);
                Ok(payload)
            }
            EventType::Rotate => Ok(BinlogEvent::Rotate(RotateEvent::decode(body)?)),
            EventType::Query => Ok(BinlogEvent::Query(QueryEvent::decode(body)?)),
            EventType::Xid => Ok(BinlogEvent::Xid(XidEvent::decode(body)?)),
            EventType::RowsQuery => Ok(BinlogEvent::RowsQuery(RowsQueryEvent::decode(body)?)),
            EventType::Gtid => Ok(BinlogEvent::Gtid(GtidEvent::decode(body)?)),
            EventType::MariadbGtid => Ok(BinlogEvent::MariadbGtid(MariadbGtidEvent::decode(
                body,
                header.server_id,
            )?)),
            EventType::Heartbeat => Ok(BinlogEvent::Heartbeat(HeartbeatEvent::decode(body)?)),
            EventType::TableMap => {
                let size = self.table_id_size(header)?;
                let event = Arc::new(TableMapEvent::decode(body, size)?);
                self.tables.insert(event.table_id, event.clone());
                Ok(BinlogEvent::TableMap(event))
            }
            kind if kind.is_rows_event() => self.parse_rows(header, body),
            other => {
                debug!("skipping undecoded binlog event {other:?}");
                Ok(BinlogEvent::Skipped(other))
            }
        }
    }

    fn parse_rows(&mut self, header: &EventHeader, body: &[u8]) -> Result<BinlogEvent> {
        let size = self.table_id_size(header)?;
        let mut r = BinReader::new(body);
        let table_id = if size == 4 {
            u64::from(r.read_u32()?)
        } else {
            r.read_u48()?
        };
        let flags = r.read_u16()?;
        let stmt_end = flags & ROWS_EVENT_FLAG_STMT_END != 0;

        if table_id == DUMMY_TABLE_ID {
            self.tables.clear();
            return Ok(BinlogEvent::Skipped(header.kind()));
        }

        let table = self.tables.get(&table_id).cloned().ok_or_else(|| {
            SyncError::schema(format!(
                "missing table map event {table_id} while parsing rows event"
            ))
        })?;

        let desc = match &self.rule {
            Some(rule) => rule.can_sync_table(&table.schema_name, &table.table_name),
            None => Some(SyncDesc::identity(&table.schema_name, &table.table_name)),
        };
        let Some(desc) = desc else {
            if stmt_end {
                self.tables.clear();
            }
            return Ok(BinlogEvent::Skipped(header.kind()));
        };

        let (action, version) = rows_kind(header.kind());
        let mut event = RowsEvent {
            action,
            version,
            table_id,
            table,
            flags,
            extra_data: Vec::new(),
            column_count: 0,
            present_bitmap1: Vec::new(),
            present_bitmap2: None,
            rows: Vec::new(),
            desc,
        };
        event.decode_body(&mut r)?;

        if stmt_end {
            self.tables.clear();
        }
        Ok(BinlogEvent::Rows(event))
    }

    /// Table ids are 6 bytes unless the format description declares a
    /// 6-byte post-header for the event type, in which case they shrink to
    /// 4.
    fn table_id_size(&self, header: &EventHeader) -> Result<u8> {
        let format = self
            .format
            .as_ref()
            .ok_or_else(|| SyncError::schema("missing format description"))?;
        let index = header.event_type as usize - 1;
        let len = format
            .event_type_header_lengths
            .get(index)
            .ok_or_else(|| {
                SyncError::protocol(format!(
                    "no post-header length for event type {} (have {})",
                    header.event_type,
                    format.event_type_header_lengths.len()
                ))
            })?;
        Ok(if *len == 6 { 4 } else { 6 })
    }
}

fn rows_kind(kind: EventType) -> (RowAction, u8) {
    match kind {
        EventType::WriteRowsV0 => (RowAction::Insert, 0),
        EventType::UpdateRowsV0 => (RowAction::Update, 0),
        EventType::DeleteRowsV0 => (RowAction::Delete, 0),
        EventType::WriteRowsV1 => (RowAction::Insert, 1),
        EventType::UpdateRowsV1 => (RowAction::Update, 1),
        EventType::DeleteRowsV1 => (RowAction::Delete, 1),
        EventType::WriteRowsV2 => (RowAction::Insert, 2),
        EventType::UpdateRowsV2 => (RowAction::Update, 2),
        // Callers dispatch on is_rows_event first.
        _ => (RowAction::Delete, 2),
    }
}
