//! Binlog event stream decoding.
//!
//! The variable-length event stream is parsed into typed events with full
//! row-image decoding (numeric, temporal, decimal and variable-length
//! codecs). The [`Parser`] keeps the per-stream state: the active format
//! description, the short-lived table-id map and the negotiated checksum
//! algorithm.

mod decimal;
mod event;
mod parser;
mod rows;
mod table_map;
mod temporal;
mod value;

pub use event::{
    BinlogEvent, Event, EventHeader, EventType, FormatDescriptionEvent, GtidEvent,
    HeartbeatEvent, MariadbGtidEvent, QueryEvent, RotateEvent, RowsQueryEvent, XidEvent,
};
pub use parser::{ChecksumAlg, Parser};
pub use rows::{Row, RowAction, RowsEvent, ROWS_EVENT_FLAG_STMT_END};
pub use table_map::TableMapEvent;
pub use value::ColumnValue;
