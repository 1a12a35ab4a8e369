//! Rows events (WRITE/UPDATE/DELETE, v0-v2) and per-type row-image
//! decoding.

use std::sync::Arc;

use crate::codec::{number_be, BinReader};
use crate::error::{Result, SyncError};
use crate::binlog::decimal::decode_decimal;
use crate::binlog::table_map::TableMapEvent;
use crate::binlog::temporal;
use crate::binlog::value::ColumnValue;
use crate::protocol::ColumnType;
use crate::rule::SyncDesc;

/// Declares that all table maps can be freed.
pub const ROWS_EVENT_FLAG_STMT_END: u16 = 0x01;

/// The DML action a rows event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

/// One row image: decoded values aligned positionally to the table's
/// columns. Columns absent from the present bitmap are [`ColumnValue::Null`].
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub columns: Vec<ColumnValue>,
}

/// <https://dev.mysql.com/doc/internals/en/rows-event.html>
///
/// For updates the row sequence is pairwise `(before, after)`; for
/// insert/delete each row stands alone.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub action: RowAction,
    pub version: u8,
    pub table_id: u64,
    pub table: Arc<TableMapEvent>,
    pub flags: u16,
    pub extra_data: Vec<u8>,
    pub column_count: u64,
    pub present_bitmap1: Vec<u8>,
    pub present_bitmap2: Option<Vec<u8>>,
    pub rows: Vec<Row>,
    /// The resolved filter decision for this table.
    pub desc: SyncDesc,
}

impl RowsEvent {
    /// Decode the body following table id and flags (which the parser has
    /// already consumed to drive its table-map cache).
    pub(crate) fn decode_body(&mut self, r: &mut BinReader<'_>) -> Result<()> {
        if self.version == 2 {
            let extra_len = r.read_u16()?;
            if extra_len > 2 {
                self.extra_data = r.read_bytes(extra_len as usize - 2)?.to_vec();
            }
        }

        self.column_count = r.read_lenenc_int()?;
        let bitmap_len = (self.column_count as usize + 7) / 8;
        self.present_bitmap1 = r.read_bytes(bitmap_len)?.to_vec();
        if self.action == RowAction::Update && self.version > 0 {
            self.present_bitmap2 = Some(r.read_bytes(bitmap_len)?.to_vec());
        }

        let bitmap1 = self.present_bitmap1.clone();
        let bitmap2 = self.present_bitmap2.clone();
        while !r.is_empty() {
            let row = self.read_row(r, &bitmap1)?;
            self.rows.push(row);

            if self.action == RowAction::Update && self.version > 0 {
                let after = bitmap2
                    .as_deref()
                    .ok_or_else(|| SyncError::protocol("update event missing after-image bitmap"))?;
                let row = self.read_row(r, after)?;
                self.rows.push(row);
            }
        }
        Ok(())
    }

    fn read_row(&self, r: &mut BinReader<'_>, present: &[u8]) -> Result<Row> {
        let column_count = self.column_count as usize;
        let mut row = Row {
            columns: vec![ColumnValue::Null; column_count],
        };

        let present_count = (0..column_count).filter(|&i| is_bit_set(present, i)).count();
        let null_bitmap = r.read_bytes((present_count + 7) / 8)?;

        let mut present_idx = 0usize;
        for i in 0..column_count {
            if !is_bit_set(present, i) {
                continue;
            }
            let null = is_bit_set(null_bitmap, present_idx);
            present_idx += 1;
            if null {
                continue;
            }
            let (code, meta) = self
                .table
                .column_types
                .get(i)
                .zip(self.table.column_metas.get(i))
                .ok_or_else(|| {
                    SyncError::schema(format!(
                        "table map for {}.{} has no column {i}",
                        self.table.schema_name, self.table.table_name
                    ))
                })?;
            row.columns[i] = read_value(r, *code, *meta)?;
        }

        Ok(row)
    }
}

fn is_bit_set(bitmap: &[u8], i: usize) -> bool {
    bitmap[i >> 3] & (1 << (i & 7)) > 0
}

/// Decode one column value. Reference: `log_event_print_value` in
/// `log_event.cc`.
fn read_value(r: &mut BinReader<'_>, type_code: u8, mut meta: u16) -> Result<ColumnValue> {
    let mut col_type = ColumnType::try_from(type_code).map_err(|code| {
        SyncError::protocol(format!("unknown column type {code} in row image"))
    })?;

    // Bug#37426: STRING metadata packs type and length into two bytes.
    if col_type == ColumnType::String && meta >= 256 {
        let b0 = (meta >> 8) as u8;
        let b1 = (meta & 0xFF) as u8;
        if b0 & 0x30 != 0x30 {
            meta = u16::from(b1) | u16::from((b0 & 0x30) ^ 0x30) << 4;
            col_type = ColumnType::try_from(b0 | 0x30).map_err(|code| {
                SyncError::protocol(format!("unknown packed string type {code}"))
            })?;
        } else {
            meta = u16::from(b1);
            col_type = ColumnType::try_from(b0).map_err(|code| {
                SyncError::protocol(format!("unknown packed string type {code}"))
            })?;
        }
    }

    match col_type {
        ColumnType::Null => Ok(ColumnValue::Null),
        ColumnType::Tiny => Ok(ColumnValue::Int8(r.read_i8()?)),
        ColumnType::Short => Ok(ColumnValue::Int16(r.read_i16()?)),
        ColumnType::Int24 => Ok(ColumnValue::Int32(r.read_i24()?)),
        ColumnType::Long => Ok(ColumnValue::Int32(r.read_i32()?)),
        ColumnType::LongLong => Ok(ColumnValue::Int64(r.read_i64()?)),
        ColumnType::Float => Ok(ColumnValue::Float(r.read_f32()?)),
        ColumnType::Double => Ok(ColumnValue::Double(r.read_f64()?)),
        ColumnType::Year => {
            let v = r.read_u8()?;
            Ok(ColumnValue::String(format!("{}", 1900 + u32::from(v))))
        }
        ColumnType::Date => Ok(ColumnValue::String(temporal::decode_date(r)?)),
        ColumnType::NewDate => Ok(ColumnValue::String(temporal::decode_date(r)?)),
        ColumnType::Time => Ok(ColumnValue::String(temporal::decode_time(r)?)),
        ColumnType::Time2 => Ok(ColumnValue::String(temporal::decode_time2(r, meta)?)),
        ColumnType::DateTime => Ok(ColumnValue::String(temporal::decode_datetime(r)?)),
        ColumnType::DateTime2 => Ok(ColumnValue::String(temporal::decode_datetime2(r, meta)?)),
        ColumnType::Timestamp => Ok(ColumnValue::String(temporal::decode_timestamp(r)?)),
        ColumnType::Timestamp2 => {
            Ok(ColumnValue::String(temporal::decode_timestamp2(r, meta)?))
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            Ok(ColumnValue::Decimal(decode_decimal(r, precision, scale)?))
        }
        ColumnType::Bit => {
            let nbits = (meta >> 8) * 8 + (meta & 0xFF);
            let len = (nbits as usize + 7) / 8;
            Ok(ColumnValue::UInt64(decode_bit(r, nbits, len)?))
        }
        ColumnType::Enum => match meta & 0xFF {
            1 => Ok(ColumnValue::Int32(i32::from(r.read_u8()?))),
            2 => Ok(ColumnValue::Int32(number_be(r.read_bytes(2)?) as i32)),
            n => Err(SyncError::protocol(format!("unknown enum pack length {n}"))),
        },
        ColumnType::Set => {
            let n = (meta & 0xFF) as usize;
            Ok(ColumnValue::UInt64(decode_bit(r, n as u16 * 8, n)?))
        }
        ColumnType::Blob => {
            let len = match meta {
                1 => usize::from(r.read_u8()?),
                2 => r.read_u16()? as usize,
                3 => r.read_u24()? as usize,
                4 => r.read_u32()? as usize,
                n => {
                    return Err(SyncError::protocol(format!(
                        "unknown blob pack length {n}"
                    )))
                }
            };
            Ok(ColumnValue::Bytes(r.read_bytes(len)?.to_vec()))
        }
        ColumnType::Varchar | ColumnType::VarString | ColumnType::String => {
            let len = if meta < 256 {
                usize::from(r.read_u8()?)
            } else {
                r.read_u16()? as usize
            };
            Ok(ColumnValue::String(
                String::from_utf8_lossy(r.read_bytes(len)?).into_owned(),
            ))
        }
        ColumnType::Json | ColumnType::Geometry => {
            let len = r.read_u16()? as usize;
            Ok(ColumnValue::Bytes(r.read_bytes(len)?.to_vec()))
        }
        other => Err(SyncError::protocol(format!(
            "no decoder for column type {other:?} meta {meta}"
        ))),
    }
}

fn decode_bit(r: &mut BinReader<'_>, nbits: u16, len: usize) -> Result<u64> {
    if nbits <= 1 {
        if len != 1 {
            return Err(SyncError::protocol(format!("invalid bit length {len}")));
        }
        return Ok(u64::from(r.read_u8()?));
    }
    Ok(number_be(r.read_bytes(len)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BinWriter;

    fn table(types: &[(u8, u16)]) -> Arc<TableMapEvent> {
        Arc::new(TableMapEvent {
            table_id: 42,
            schema_name: "d".into(),
            table_name: "t".into(),
            column_count: types.len() as u64,
            column_types: types.iter().map(|t| t.0).collect(),
            column_metas: types.iter().map(|t| t.1).collect(),
            null_bitmap: vec![0; (types.len() + 7) / 8],
            ..TableMapEvent::default()
        })
    }

    fn rows_event(action: RowAction, version: u8, table: Arc<TableMapEvent>) -> RowsEvent {
        RowsEvent {
            action,
            version,
            table_id: table.table_id,
            desc: SyncDesc::identity(&table.schema_name, &table.table_name),
            table,
            flags: 0,
            extra_data: Vec::new(),
            column_count: 0,
            present_bitmap1: Vec::new(),
            present_bitmap2: None,
            rows: Vec::new(),
        }
    }

    #[test]
    fn test_write_rows_decode() {
        let t = table(&[(ColumnType::Long as u8, 0), (ColumnType::Varchar as u8, 64)]);
        let mut e = rows_event(RowAction::Insert, 2, t);

        let mut w = BinWriter::new();
        w.put_u16(2); // v2 extra data length (2 = none)
        w.put_lenenc_int(2);
        w.put_u8(0b11); // present bitmap
        w.put_u8(0); // null bitmap
        w.put_u32(1);
        w.put_u8(1);
        w.put_string_eof("a");

        let mut r = BinReader::new(w.as_slice());
        e.decode_body(&mut r).unwrap();
        assert_eq!(e.rows.len(), 1);
        assert_eq!(e.rows[0].columns[0], ColumnValue::Int32(1));
        assert_eq!(e.rows[0].columns[1], ColumnValue::String("a".into()));
    }

    #[test]
    fn test_null_bitmap_positions() {
        // [INT, VARCHAR(64), DATETIME] with all columns present and the
        // null bit set for column 1 decodes to [int, Null, datetime].
        let t = table(&[
            (ColumnType::Long as u8, 0),
            (ColumnType::Varchar as u8, 64),
            (ColumnType::DateTime as u8, 0),
        ]);
        let mut e = rows_event(RowAction::Insert, 1, t);

        let mut w = BinWriter::new();
        w.put_lenenc_int(3);
        w.put_u8(0b111); // present bitmap
        w.put_u8(0b010); // null bitmap: column 1 is NULL
        w.put_u32(7);
        w.put_u64(20200101123045);

        let mut r = BinReader::new(w.as_slice());
        e.decode_body(&mut r).unwrap();
        assert_eq!(e.rows.len(), 1);
        assert_eq!(e.rows[0].columns[0], ColumnValue::Int32(7));
        assert_eq!(e.rows[0].columns[1], ColumnValue::Null);
        assert_eq!(
            e.rows[0].columns[2],
            ColumnValue::String("2020-01-01 12:30:45".into())
        );
    }

    #[test]
    fn test_absent_column_elided_as_null() {
        let t = table(&[(ColumnType::Long as u8, 0), (ColumnType::Long as u8, 0)]);
        let mut e = rows_event(RowAction::Insert, 1, t);

        let mut w = BinWriter::new();
        w.put_lenenc_int(2);
        w.put_u8(0b01); // only column 0 present
        w.put_u8(0); // null bitmap covers one present column
        w.put_u32(5);

        let mut r = BinReader::new(w.as_slice());
        e.decode_body(&mut r).unwrap();
        assert_eq!(e.rows[0].columns[0], ColumnValue::Int32(5));
        assert_eq!(e.rows[0].columns[1], ColumnValue::Null);
    }

    #[test]
    fn test_update_rows_pairwise() {
        let t = table(&[(ColumnType::Long as u8, 0), (ColumnType::Varchar as u8, 64)]);
        let mut e = rows_event(RowAction::Update, 2, t);

        let mut w = BinWriter::new();
        w.put_u16(2);
        w.put_lenenc_int(2);
        w.put_u8(0b11); // before image bitmap
        w.put_u8(0b11); // after image bitmap
        // before row
        w.put_u8(0);
        w.put_u32(1);
        w.put_u8(1);
        w.put_string_eof("a");
        // after row
        w.put_u8(0);
        w.put_u32(1);
        w.put_u8(1);
        w.put_string_eof("b");

        let mut r = BinReader::new(w.as_slice());
        e.decode_body(&mut r).unwrap();
        assert_eq!(e.rows.len(), 2);
        assert_eq!(e.rows[0].columns[1], ColumnValue::String("a".into()));
        assert_eq!(e.rows[1].columns[1], ColumnValue::String("b".into()));
    }

    #[test]
    fn test_read_value_integers() {
        let mut w = BinWriter::new();
        w.put_u8(0xFF); // Tiny -1
        w.put_u16(0x8000); // Short i16::MIN
        w.put_bytes(&[0xFF, 0xFF, 0xFF]); // Int24 -1
        w.put_u64(u64::MAX); // LongLong -1

        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Tiny as u8, 0).unwrap(),
            ColumnValue::Int8(-1)
        );
        assert_eq!(
            read_value(&mut r, ColumnType::Short as u8, 0).unwrap(),
            ColumnValue::Int16(i16::MIN)
        );
        assert_eq!(
            read_value(&mut r, ColumnType::Int24 as u8, 0).unwrap(),
            ColumnValue::Int32(-1)
        );
        assert_eq!(
            read_value(&mut r, ColumnType::LongLong as u8, 0).unwrap(),
            ColumnValue::Int64(-1)
        );
    }

    #[test]
    fn test_read_value_year() {
        let data = [120u8];
        let mut r = BinReader::new(&data);
        assert_eq!(
            read_value(&mut r, ColumnType::Year as u8, 0).unwrap(),
            ColumnValue::String("2020".into())
        );
    }

    #[test]
    fn test_read_value_floats() {
        let mut w = BinWriter::new();
        w.put_u32(1.5f32.to_bits());
        w.put_u64(2.25f64.to_bits());
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Float as u8, 0).unwrap(),
            ColumnValue::Float(1.5)
        );
        assert_eq!(
            read_value(&mut r, ColumnType::Double as u8, 0).unwrap(),
            ColumnValue::Double(2.25)
        );
    }

    #[test]
    fn test_read_value_blob_widths() {
        let mut w = BinWriter::new();
        w.put_u8(2);
        w.put_bytes(b"hi");
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Blob as u8, 1).unwrap(),
            ColumnValue::Bytes(b"hi".to_vec())
        );

        let mut w = BinWriter::new();
        w.put_u16(3);
        w.put_bytes(b"abc");
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Blob as u8, 2).unwrap(),
            ColumnValue::Bytes(b"abc".to_vec())
        );
    }

    #[test]
    fn test_read_value_varchar_two_byte_length() {
        let mut w = BinWriter::new();
        w.put_u16(3);
        w.put_bytes(b"xyz");
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Varchar as u8, 300).unwrap(),
            ColumnValue::String("xyz".into())
        );
    }

    #[test]
    fn test_read_value_string_bug37426() {
        // ENUM stored as STRING: b0 = Enum (0xF7), real meta 1.
        let meta: u16 = u16::from(ColumnType::Enum as u8) << 8 | 1;
        let data = [2u8];
        let mut r = BinReader::new(&data);
        assert_eq!(
            read_value(&mut r, ColumnType::String as u8, meta).unwrap(),
            ColumnValue::Int32(2)
        );
    }

    #[test]
    fn test_read_value_bit_and_set() {
        let mut w = BinWriter::new();
        w.put_u8(0b101);
        let mut r = BinReader::new(w.as_slice());
        // 1-bit BIT column.
        assert_eq!(
            read_value(&mut r, ColumnType::Bit as u8, 1).unwrap(),
            ColumnValue::UInt64(0b101)
        );

        // 12-bit BIT column: meta high byte = 1 (8 bits), low = 4.
        let mut w = BinWriter::new();
        w.put_bytes(&[0x0A, 0xBC]);
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Bit as u8, 1 << 8 | 4).unwrap(),
            ColumnValue::UInt64(0x0ABC)
        );

        // SET over one byte.
        let mut w = BinWriter::new();
        w.put_u8(0b110);
        let mut r = BinReader::new(w.as_slice());
        assert_eq!(
            read_value(&mut r, ColumnType::Set as u8, 1).unwrap(),
            ColumnValue::UInt64(0b110)
        );
    }

    #[test]
    fn test_read_value_unknown_type_fails() {
        let data = [0u8; 8];
        let mut r = BinReader::new(&data);
        assert!(read_value(&mut r, 77, 0).is_err());
    }

    #[test]
    fn test_truncated_row_fails() {
        let t = table(&[(ColumnType::Long as u8, 0)]);
        let mut e = rows_event(RowAction::Insert, 1, t);

        let mut w = BinWriter::new();
        w.put_lenenc_int(1);
        w.put_u8(0b1);
        w.put_u8(0);
        w.put_u8(1); // only one byte of the i32

        let mut r = BinReader::new(w.as_slice());
        assert!(matches!(
            e.decode_body(&mut r),
            Err(SyncError::Overflow)
        ));
    }
}
