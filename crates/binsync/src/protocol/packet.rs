//! Packet encode/decode for the connection and replication phases.

use sha1::{Digest, Sha1};

use crate::codec::{BinReader, BinWriter};
use crate::error::{Result, SyncError};
use crate::protocol::{CapabilityFlags, COM_BINLOG_DUMP, COM_REGISTER_SLAVE};
use crate::protocol::{MYSQL_NATIVE_PASSWORD_PLUGIN, PACKET_HEADER_EOF, PACKET_HEADER_ERR};
use crate::slave::ReplicationPoint;

/// The 4-byte frame prefix: 24-bit little-endian payload length plus a
/// sequence number.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketHeader(pub [u8; 4]);

impl PacketHeader {
    pub fn length(&self) -> usize {
        usize::from(self.0[0]) | usize::from(self.0[1]) << 8 | usize::from(self.0[2]) << 16
    }

    pub fn set_length(&mut self, v: usize) {
        let uv = v as u32;
        self.0[0] = (uv & 0xFF) as u8;
        self.0[1] = (uv >> 8 & 0xFF) as u8;
        self.0[2] = (uv >> 16 & 0xFF) as u8;
    }

    pub fn sequence(&self) -> u8 {
        self.0[3]
    }

    pub fn set_sequence(&mut self, v: u8) {
        self.0[3] = v;
    }
}

/// Initial greeting from the server.
///
/// <https://dev.mysql.com/doc/internals/en/connection-phase-packets.html>
#[derive(Debug, Clone)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = BinReader::new(data);

        let protocol_version = r.read_u8()?;
        let server_version = r.read_string_nul()?;
        let connection_id = r.read_u32()?;

        // First 8 bytes of the scramble.
        let mut auth_plugin_data = r.read_bytes(8)?.to_vec();
        // Filler.
        r.read_u8()?;

        let cap_low = r.read_u16()?;
        let character_set = r.read_u8()?;
        let status_flags = r.read_u16()?;
        let cap_high = r.read_u16()?;
        let capability_flags =
            CapabilityFlags::new(u32::from(cap_high) << 16 | u32::from(cap_low));

        let auth_data_len = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            r.read_u8()?
        } else {
            0
        };

        // Reserved.
        r.skip(10)?;

        if capability_flags.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            // Up to 12 additional scramble bytes followed by '\0'.
            let part2 = if auth_data_len > 8 {
                (auth_data_len as usize - 8).min(13)
            } else {
                13
            };
            auth_plugin_data.extend_from_slice(r.read_bytes(part2 - 1)?);
            r.read_u8()?;
        }

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            // Some servers omit the trailing NUL on the plugin name.
            let rest = r.rest();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_name,
        })
    }
}

/// `SHA1(pw) XOR SHA1(scramble || SHA1(SHA1(pw)))`; empty for an empty
/// password.
pub fn scramble_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let stage1 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3 = hasher.finalize();

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Client reply to the handshake, asserting `mysql_native_password`.
#[derive(Debug, Clone)]
pub struct HandshakeResponsePacket {
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub username: String,
    pub password: String,
    pub database: String,
    pub auth_plugin_data: Vec<u8>,
}

impl HandshakeResponsePacket {
    pub fn encode(&self) -> Vec<u8> {
        let token = scramble_password(&self.password, &self.auth_plugin_data);

        let mut caps = self.capability_flags;
        caps.set(CapabilityFlags::CLIENT_PROTOCOL_41);
        if !self.database.is_empty() {
            caps.set(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
        }

        let mut w = BinWriter::with_capacity(64 + self.username.len());
        w.put_u32(caps.value());
        // Max packet size, unused.
        w.put_u32(0);
        w.put_u8(self.charset);
        w.put_bytes(&[0u8; 23]);
        w.put_string_nul(&self.username);
        w.put_len_bytes(&token);
        if !self.database.is_empty() {
            w.put_string_nul(&self.database);
        }
        w.put_string_nul(MYSQL_NATIVE_PASSWORD_PLUGIN);
        w.into_vec()
    }
}

/// OK_Packet. Only the fields replication setup needs are kept.
///
/// <https://dev.mysql.com/doc/internals/en/packet-OK_Packet.html>
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

impl OkPacket {
    pub fn decode(data: &[u8], capability: CapabilityFlags) -> Result<Self> {
        let mut p = Self::default();
        let mut r = BinReader::new(data);

        // Header byte, already dispatched on by the caller.
        r.read_u8()?;
        p.affected_rows = r.read_lenenc_int()?;
        p.last_insert_id = r.read_lenenc_int()?;
        if capability.has(CapabilityFlags::CLIENT_PROTOCOL_41) {
            p.status_flags = r.read_u16()?;
            p.warnings = r.read_u16()?;
        } else if capability.has(CapabilityFlags::CLIENT_TRANSACTIONS) {
            p.status_flags = r.read_u16()?;
        }
        Ok(p)
    }
}

/// ERR_Packet; `error_code` and message are surfaced verbatim.
///
/// <https://dev.mysql.com/doc/internals/en/packet-ERR_Packet.html>
#[derive(Debug, Clone, Default)]
pub struct ErrPacket {
    pub error_code: u16,
    pub state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn decode(data: &[u8], capability: CapabilityFlags) -> Result<Self> {
        let mut r = BinReader::new(data);
        let header = r.read_u8()?;
        if header != PACKET_HEADER_ERR {
            return Err(SyncError::protocol(format!(
                "not an ERR packet, header = 0x{header:02x}"
            )));
        }

        let mut p = Self {
            error_code: r.read_u16()?,
            ..Self::default()
        };
        if capability.has(CapabilityFlags::CLIENT_PROTOCOL_41) {
            // '#' marker then the 5-byte sql state.
            r.read_u8()?;
            p.state = r.read_string_fixed(5)?;
        }
        p.message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(p)
    }

    pub fn into_error(self) -> SyncError {
        SyncError::Server {
            code: self.error_code,
            message: self.message,
        }
    }
}

/// The 5-byte EOF_Packet terminating column and row runs.
#[derive(Debug, Clone, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != 5 || data[0] != PACKET_HEADER_EOF {
            return Err(SyncError::protocol("not an EOF packet"));
        }
        let mut r = BinReader::new(&data[1..]);
        Ok(Self {
            warnings: r.read_u16()?,
            status_flags: r.read_u16()?,
        })
    }
}

pub(crate) fn is_eof_packet(data: &[u8]) -> bool {
    data.first() == Some(&PACKET_HEADER_EOF) && data.len() == 5
}

/// COM_REGISTER_SLAVE.
///
/// <https://dev.mysql.com/doc/internals/en/com-register-slave.html>
#[derive(Debug, Clone, Default)]
pub struct RegisterSlavePacket {
    pub server_id: u32,
    pub hostname: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    pub rank: u32,
    pub master_id: u32,
}

impl RegisterSlavePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BinWriter::with_capacity(
            18 + self.hostname.len() + self.user.len() + self.password.len(),
        );
        w.put_u8(COM_REGISTER_SLAVE);
        w.put_u32(self.server_id);
        // Report host/user/password, usually empty.
        w.put_len_string(&self.hostname);
        w.put_len_string(&self.user);
        w.put_len_string(&self.password);
        w.put_u16(self.port);
        w.put_u32(self.rank);
        // 0 = use this connection's server id.
        w.put_u32(self.master_id);
        w.into_vec()
    }
}

/// COM_BINLOG_DUMP.
///
/// <https://dev.mysql.com/doc/internals/en/com-binlog-dump.html>
#[derive(Debug, Clone)]
pub struct BinlogDumpPacket {
    pub point: ReplicationPoint,
    pub flags: u16,
    pub server_id: u32,
}

impl BinlogDumpPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = BinWriter::with_capacity(11 + self.point.filename.len());
        w.put_u8(COM_BINLOG_DUMP);
        w.put_u32(self.point.offset);
        w.put_u16(self.flags);
        w.put_u32(self.server_id);
        w.put_string_eof(&self.point.filename);
        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_length_bytes() {
        // The low/mid/high bytes on the wire are (v & 0xFF), (v >> 8) & 0xFF,
        // (v >> 16) & 0xFF.
        let mut h = PacketHeader::default();
        h.set_length(0x00FF_FFFE);
        assert_eq!(&h.0[..3], &[0xFE, 0xFF, 0xFF]);
        assert_eq!(h.length(), 0x00FF_FFFE);

        h.set_length(0x0102_03);
        assert_eq!(&h.0[..3], &[0x03, 0x02, 0x01]);
        assert_eq!(h.length(), 0x010203);

        h.set_sequence(7);
        assert_eq!(h.sequence(), 7);
    }

    fn sample_handshake() -> Vec<u8> {
        let mut w = BinWriter::new();
        w.put_u8(10); // protocol version
        w.put_string_nul("5.7.30-log");
        w.put_u32(99); // connection id
        w.put_bytes(b"abcdefgh"); // scramble part 1
        w.put_u8(0); // filler
        let caps: u32 = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        w.put_u16((caps & 0xFFFF) as u16);
        w.put_u8(33); // charset
        w.put_u16(0x0002); // status
        w.put_u16((caps >> 16) as u16);
        w.put_u8(21); // auth plugin data length
        w.put_bytes(&[0u8; 10]); // reserved
        w.put_bytes(b"ijklmnopqrst"); // scramble part 2
        w.put_u8(0);
        w.put_string_nul("mysql_native_password");
        w.into_vec()
    }

    #[test]
    fn test_handshake_decode() {
        let p = HandshakePacket::decode(&sample_handshake()).unwrap();
        assert_eq!(p.protocol_version, 10);
        assert_eq!(p.server_version, "5.7.30-log");
        assert_eq!(p.connection_id, 99);
        assert_eq!(p.auth_plugin_data, b"abcdefghijklmnopqrst");
        assert_eq!(p.character_set, 33);
        assert!(p
            .capability_flags
            .has(CapabilityFlags::CLIENT_SECURE_CONNECTION));
        assert_eq!(p.auth_plugin_name, "mysql_native_password");
    }

    #[test]
    fn test_scramble_password() {
        let seed = b"abcdefghijklmnopqrst";
        let token = scramble_password("secret", seed);
        assert_eq!(token.len(), 20);
        // Deterministic.
        assert_eq!(token, scramble_password("secret", seed));
        assert_ne!(token, scramble_password("other", seed));
        assert!(scramble_password("", seed).is_empty());
    }

    #[test]
    fn test_handshake_response_encode() {
        let p = HandshakeResponsePacket {
            capability_flags: CapabilityFlags::default_client(),
            charset: 33,
            username: "repl".into(),
            password: "pw".into(),
            database: String::new(),
            auth_plugin_data: b"abcdefghijklmnopqrst".to_vec(),
        };
        let data = p.encode();
        let mut r = BinReader::new(&data);
        let caps = CapabilityFlags::new(r.read_u32().unwrap());
        assert!(caps.has(CapabilityFlags::CLIENT_PROTOCOL_41));
        assert!(!caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert_eq!(r.read_u32().unwrap(), 0); // max packet size
        assert_eq!(r.read_u8().unwrap(), 33);
        r.skip(23).unwrap();
        assert_eq!(r.read_string_nul().unwrap(), "repl");
        let token = r.read_lenenc_bytes().unwrap();
        assert_eq!(token.len(), 20);
        assert_eq!(r.read_string_nul().unwrap(), "mysql_native_password");
    }

    #[test]
    fn test_err_packet_decode() {
        let mut w = BinWriter::new();
        w.put_u8(0xFF);
        w.put_u16(1045);
        w.put_u8(b'#');
        w.put_string_eof("28000");
        w.put_string_eof("Access denied for user");
        let caps = CapabilityFlags::new(CapabilityFlags::CLIENT_PROTOCOL_41);
        let p = ErrPacket::decode(w.as_slice(), caps).unwrap();
        assert_eq!(p.error_code, 1045);
        assert_eq!(p.state, "28000");
        assert_eq!(p.message, "Access denied for user");
    }

    #[test]
    fn test_register_slave_encode() {
        let p = RegisterSlavePacket {
            server_id: 1001,
            ..Default::default()
        };
        let data = p.encode();
        assert_eq!(data[0], COM_REGISTER_SLAVE);
        let mut r = BinReader::new(&data[1..]);
        assert_eq!(r.read_u32().unwrap(), 1001);
        assert_eq!(r.read_len_string().unwrap(), "");
        assert_eq!(r.read_len_string().unwrap(), "");
        assert_eq!(r.read_len_string().unwrap(), "");
        assert_eq!(r.read_u16().unwrap(), 0);
        assert_eq!(r.read_u32().unwrap(), 0);
        assert_eq!(r.read_u32().unwrap(), 0);
        assert!(r.is_empty());
    }

    #[test]
    fn test_binlog_dump_encode() {
        let p = BinlogDumpPacket {
            point: ReplicationPoint {
                filename: "mysql-bin.000003".into(),
                offset: 4,
                gtid: String::new(),
            },
            flags: 0,
            server_id: 1001,
        };
        let data = p.encode();
        assert_eq!(data[0], COM_BINLOG_DUMP);
        let mut r = BinReader::new(&data[1..]);
        assert_eq!(r.read_u32().unwrap(), 4);
        assert_eq!(r.read_u16().unwrap(), 0);
        assert_eq!(r.read_u32().unwrap(), 1001);
        assert_eq!(r.read_string_eof().unwrap(), "mysql-bin.000003");
    }
}
