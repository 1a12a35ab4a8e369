//! TABLE_MAP_EVENT: the transient association between a numeric table id
//! and schema/table identity plus per-column decoding metadata.

use crate::codec::{number_be, BinReader};
use crate::error::{Result, SyncError};
use crate::protocol::ColumnType;

/// <https://dev.mysql.com/doc/internals/en/table-map-event.html>
#[derive(Debug, Clone, Default)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub flags: u16,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: u64,
    /// Raw column type codes, one per column.
    pub column_types: Vec<u8>,
    /// Per-column metadata, widened to u16.
    pub column_metas: Vec<u16>,
    pub null_bitmap: Vec<u8>,
}

impl TableMapEvent {
    /// Decode the event body. `table_id_size` (4 or 6) comes from the
    /// format description's per-type header length.
    pub fn decode(data: &[u8], table_id_size: u8) -> Result<Self> {
        let mut r = BinReader::new(data);
        let mut e = Self {
            table_id: if table_id_size == 4 {
                u64::from(r.read_u32()?)
            } else {
                r.read_u48()?
            },
            ..Self::default()
        };

        e.flags = r.read_u16()?;

        e.schema_name = r.read_len_string()?;
        r.read_u8()?;
        e.table_name = r.read_len_string()?;
        r.read_u8()?;

        e.column_count = r.read_lenenc_int()?;
        e.column_types = r.read_bytes(e.column_count as usize)?.to_vec();

        let meta_blob = r.read_lenenc_bytes()?;
        e.column_metas = decode_column_metas(&e.column_types, meta_blob)?;

        let null_bitmap = r.rest();
        if null_bitmap.len() != (e.column_count as usize + 7) / 8 {
            return Err(SyncError::protocol("invalid table map null bitmap"));
        }
        e.null_bitmap = null_bitmap.to_vec();

        Ok(e)
    }
}

/// Per-type metadata widths.
///
/// STRING and NEW_DECIMAL pack two bytes big-endian; VARCHAR-likes and BIT
/// are a little-endian u16; the single-byte group carries a size or
/// fractional-second precision. The types MySQL never emits as table-map
/// metadata are rejected.
fn decode_column_metas(column_types: &[u8], blob: &[u8]) -> Result<Vec<u16>> {
    let mut r = BinReader::new(blob);
    let mut metas = Vec::with_capacity(column_types.len());

    for &code in column_types {
        let meta = match ColumnType::try_from(code) {
            Ok(ColumnType::String) | Ok(ColumnType::NewDecimal) => {
                // For STRING the two bytes pack type + length (Bug#37426);
                // for NEW_DECIMAL high byte is precision, low is scale.
                number_be(r.read_bytes(2)?) as u16
            }
            Ok(ColumnType::VarString) | Ok(ColumnType::Varchar) | Ok(ColumnType::Bit) => {
                r.read_u16()?
            }
            Ok(ColumnType::Blob)
            | Ok(ColumnType::Double)
            | Ok(ColumnType::Float)
            | Ok(ColumnType::Geometry)
            | Ok(ColumnType::Json)
            | Ok(ColumnType::Time2)
            | Ok(ColumnType::DateTime2)
            | Ok(ColumnType::Timestamp2) => u16::from(r.read_u8()?),
            Ok(ColumnType::NewDate)
            | Ok(ColumnType::Enum)
            | Ok(ColumnType::Set)
            | Ok(ColumnType::TinyBlob)
            | Ok(ColumnType::MediumBlob)
            | Ok(ColumnType::LongBlob) => {
                return Err(SyncError::protocol(format!(
                    "invalid table map column type {code}"
                )))
            }
            _ => 0,
        };
        metas.push(meta);
    }
    Ok(metas)
}
