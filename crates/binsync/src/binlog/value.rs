//! Decoded column values.

/// A single decoded column value, aligned positionally to the table's
/// columns.
///
/// Temporal types are delivered pre-formatted as strings; decimals keep
/// their exact textual form instead of being flattened to a float.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Decimal(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Reinterpret a signed integer as its unsigned counterpart of the same
    /// width. Applied when the table column is declared `unsigned`.
    pub fn into_unsigned(self) -> Self {
        match self {
            Self::Int8(v) => Self::UInt8(v as u8),
            Self::Int16(v) => Self::UInt16(v as u16),
            Self::Int32(v) => Self::UInt32(v as u32),
            Self::Int64(v) => Self::UInt64(v as u64),
            other => other,
        }
    }

    /// Stable textual form, used for primary-key partition keys.
    pub fn to_text(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Int8(v) => v.to_string(),
            Self::Int16(v) => v.to_string(),
            Self::Int32(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::UInt8(v) => v.to_string(),
            Self::UInt16(v) => v.to_string(),
            Self::UInt32(v) => v.to_string(),
            Self::UInt64(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Double(v) => v.to_string(),
            Self::String(v) => v.clone(),
            Self::Bytes(v) => String::from_utf8_lossy(v).into_owned(),
            Self::Decimal(v) => v.clone(),
        }
    }
}
