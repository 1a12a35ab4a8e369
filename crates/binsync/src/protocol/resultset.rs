//! Minimal text result-set reader.
//!
//! Just enough of <https://dev.mysql.com/doc/internals/en/com-query-response.html>
//! for replication setup queries such as `SELECT @master_binlog_checksum`:
//! column definitions until EOF, then text rows until EOF. Values arrive as
//! length-encoded strings; NULL is the single `0xFB` sentinel byte.

use crate::codec::BinReader;
use crate::error::{Result, SyncError};
use crate::protocol::conn::Conn;
use crate::protocol::packet::is_eof_packet;
use crate::protocol::{ErrPacket, PACKET_HEADER_ERR, PACKET_HEADER_LOCAL_INFILE};

const NULL_SENTINEL: u8 = 0xFB;

/// A column definition from a result set header.
#[derive(Debug, Clone, Default)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);
        // catalog, always "def".
        r.read_lenenc_bytes()?;
        let schema = r.read_lenenc_string()?;
        let table = r.read_lenenc_string()?;
        // org_table.
        r.read_lenenc_bytes()?;
        let name = r.read_lenenc_string()?;
        // org_name.
        r.read_lenenc_bytes()?;

        // Length of the fixed-size tail, always 0x0c.
        let fixed = r.read_lenenc_int()?;
        if fixed != 0x0C {
            return Err(SyncError::protocol(format!(
                "invalid fixed-length field size {fixed}"
            )));
        }
        Ok(Self {
            schema,
            table,
            name,
            character_set: r.read_u16()?,
            column_length: r.read_u32()?,
            column_type: r.read_u8()?,
            flags: r.read_u16()?,
            decimals: r.read_u8()?,
        })
    }
}

/// An eagerly-read text result set.
#[derive(Debug, Default)]
pub struct TextResultSet {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl TextResultSet {
    /// Read the column definitions and all rows following a column-count
    /// packet.
    pub(crate) async fn read(conn: &mut Conn, count_packet: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(count_packet);
        let column_count = r.read_lenenc_int()? as usize;
        if !r.is_empty() {
            return Err(SyncError::protocol("trailing bytes after column count"));
        }

        let mut rs = Self::default();

        // Column definitions, terminated by EOF.
        loop {
            let data = conn.read_packet().await?;
            if is_eof_packet(&data) {
                if rs.columns.len() != column_count {
                    return Err(SyncError::protocol(format!(
                        "expected {column_count} columns, received {}",
                        rs.columns.len()
                    )));
                }
                break;
            }
            if data.first() == Some(&PACKET_HEADER_ERR) {
                return Err(ErrPacket::decode(&data, conn.capability())?.into_error());
            }
            rs.columns.push(ColumnDef::decode(&data)?);
        }

        // Text rows, terminated by EOF.
        loop {
            let data = conn.read_packet().await?;
            if is_eof_packet(&data) {
                break;
            }
            match data.first() {
                Some(&PACKET_HEADER_ERR) => {
                    return Err(ErrPacket::decode(&data, conn.capability())?.into_error())
                }
                Some(&PACKET_HEADER_LOCAL_INFILE) if data.len() == 1 => {
                    // A lone 0xFB would be a malformed row here.
                    return Err(SyncError::protocol("malformed row packet"));
                }
                _ => rs.rows.push(Self::decode_row(&data, column_count)?),
            }
        }

        Ok(rs)
    }

    fn decode_row(data: &[u8], column_count: usize) -> Result<Vec<Option<String>>> {
        let mut r = BinReader::new(data);
        let mut row = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            match r.peek_u8() {
                None => return Err(SyncError::Overflow),
                Some(NULL_SENTINEL) => {
                    r.read_u8()?;
                    row.push(None);
                }
                Some(_) => row.push(Some(r.read_lenenc_string()?)),
            }
        }
        Ok(row)
    }

    /// The value at (row, column), if present and non-NULL.
    pub fn value_at(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }
}
