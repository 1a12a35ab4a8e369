//! MySQL client/replication wire protocol.
//!
//! Packet framing (24-bit length + sequence), handshake v10 with
//! `mysql_native_password`, text `COM_QUERY` round-trips with a minimal
//! result-set reader, `COM_REGISTER_SLAVE` and `COM_BINLOG_DUMP`.

mod conn;
mod packet;
mod resultset;

pub use conn::{Conn, HandshakeInfo, QueryResponse};
pub use packet::{
    scramble_password, BinlogDumpPacket, EofPacket, ErrPacket, HandshakePacket,
    HandshakeResponsePacket, OkPacket, PacketHeader, RegisterSlavePacket,
};
pub use resultset::{ColumnDef, TextResultSet};

use serde::{Deserialize, Serialize};

/// Capability flags exchanged during the handshake.
///
/// <https://dev.mysql.com/doc/internals/en/capability-flags.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
    pub const CLIENT_SESSION_TRACK: u32 = 0x0080_0000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn intersect(&self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// The capabilities this client asserts before intersecting with the
    /// server's set.
    pub fn default_client() -> Self {
        Self(
            Self::CLIENT_PROTOCOL_41
                | Self::CLIENT_SECURE_CONNECTION
                | Self::CLIENT_LONG_PASSWORD
                | Self::CLIENT_TRANSACTIONS
                | Self::CLIENT_LONG_FLAG,
        )
    }
}

/// First-byte markers of response packets.
pub const PACKET_HEADER_OK: u8 = 0x00;
pub const PACKET_HEADER_LOCAL_INFILE: u8 = 0xFB;
pub const PACKET_HEADER_EOF: u8 = 0xFE;
pub const PACKET_HEADER_ERR: u8 = 0xFF;

/// Command bytes used by the replication client.
pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

/// utf8_general_ci, the charset asserted in the handshake response.
pub const CHARSET_UTF8_GENERAL_CI: u8 = 33;

pub const MYSQL_NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";

/// Payloads of exactly this size are continued in a follow-up packet.
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Column type codes shared by the text protocol and the binlog row images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl TryFrom<u8> for ColumnType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0 => Self::Decimal,
            1 => Self::Tiny,
            2 => Self::Short,
            3 => Self::Long,
            4 => Self::Float,
            5 => Self::Double,
            6 => Self::Null,
            7 => Self::Timestamp,
            8 => Self::LongLong,
            9 => Self::Int24,
            10 => Self::Date,
            11 => Self::Time,
            12 => Self::DateTime,
            13 => Self::Year,
            14 => Self::NewDate,
            15 => Self::Varchar,
            16 => Self::Bit,
            17 => Self::Timestamp2,
            18 => Self::DateTime2,
            19 => Self::Time2,
            245 => Self::Json,
            246 => Self::NewDecimal,
            247 => Self::Enum,
            248 => Self::Set,
            249 => Self::TinyBlob,
            250 => Self::MediumBlob,
            251 => Self::LongBlob,
            252 => Self::Blob,
            253 => Self::VarString,
            254 => Self::String,
            255 => Self::Geometry,
            other => return Err(other),
        })
    }
}

/// A candidate primary to pull the binlog stream from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataSource {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl DataSource {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection settings for a destination database.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub charset: String,
}
