//! The client connection: dialing, handshake, framed packet exchange and
//! text queries.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::codec::BinWriter;
use crate::error::{Result, SyncError};
use crate::protocol::resultset::TextResultSet;
use crate::protocol::{
    BinlogDumpPacket, CapabilityFlags, DataSource, ErrPacket, HandshakePacket,
    HandshakeResponsePacket, OkPacket, PacketHeader, RegisterSlavePacket,
};
use crate::protocol::{
    CHARSET_UTF8_GENERAL_CI, COM_QUERY, MAX_PAYLOAD_LEN, PACKET_HEADER_ERR,
    PACKET_HEADER_LOCAL_INFILE, PACKET_HEADER_OK,
};
use crate::slave::{ReplicationConfig, ReplicationPoint};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Server identity captured during the handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
}

impl std::fmt::Display for HandshakeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "protocol version:{} server version:{} connection id:{}",
            self.protocol_version, self.server_version, self.connection_id
        )
    }
}

/// Response to a text query.
#[derive(Debug)]
pub enum QueryResponse {
    Ok(OkPacket),
    Rows(TextResultSet),
}

/// A connection to a MySQL primary.
///
/// The sequence counter starts at 0 on each command cycle and increments per
/// transmitted packet in both directions.
pub struct Conn {
    stream: BufReader<TcpStream>,
    seq: u8,
    capability: CapabilityFlags,
    read_timeout: Option<Duration>,
    info: HandshakeInfo,
}

impl Conn {
    /// Dial and authenticate against a data source.
    pub async fn connect(ds: &DataSource, database: &str) -> Result<Self> {
        let addr = ds.address();
        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(SyncError::Io(e)),
            Err(_) => {
                return Err(SyncError::timeout(format!(
                    "dial {addr} exceeded {}s",
                    DIAL_TIMEOUT.as_secs()
                )))
            }
        };

        let mut conn = Self {
            stream: BufReader::new(stream),
            seq: 0,
            capability: CapabilityFlags::default(),
            read_timeout: None,
            info: HandshakeInfo::default(),
        };
        conn.handshake(&ds.username, &ds.password, database).await?;
        info!("connected to mysql {} ({})", addr, conn.info);
        Ok(conn)
    }

    pub fn handshake_info(&self) -> &HandshakeInfo {
        &self.info
    }

    /// Set (or clear) the per-read deadline. A missed heartbeat surfaces as
    /// a timeout from the next read.
    pub fn set_read_timeout(&mut self, dura: Option<Duration>) {
        self.read_timeout = dura;
    }

    /// Enable TCP keepalive with the given period.
    pub fn set_keepalive(&mut self, period: Duration) -> Result<()> {
        let sock = SockRef::from(self.stream.get_ref());
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(period))?;
        Ok(())
    }

    pub fn reset_sequence(&mut self) {
        self.seq = 0;
    }

    /// Read one reassembled packet payload.
    pub async fn read_packet(&mut self) -> Result<Vec<u8>> {
        match self.read_timeout {
            Some(d) => match timeout(d, read_packet_from(&mut self.stream, &mut self.seq)).await {
                Ok(res) => res,
                Err(_) => Err(SyncError::timeout(format!(
                    "read deadline {}s exceeded",
                    d.as_secs()
                ))),
            },
            None => read_packet_from(&mut self.stream, &mut self.seq).await,
        }
    }

    /// Frame and send one payload, splitting at the 2^24-1 boundary.
    pub async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        write_packet_to(self.stream.get_mut(), &mut self.seq, payload).await
    }

    async fn handshake(&mut self, username: &str, password: &str, database: &str) -> Result<()> {
        let data = self.read_packet().await?;
        if data.first() == Some(&PACKET_HEADER_ERR) {
            return Err(ErrPacket::decode(&data, self.capability)?.into_error());
        }
        let handshake = HandshakePacket::decode(&data)?;

        if !handshake
            .capability_flags
            .has(CapabilityFlags::CLIENT_PROTOCOL_41)
        {
            return Err(SyncError::auth("protocol version < 4.1 is not supported"));
        }
        if !handshake
            .capability_flags
            .has(CapabilityFlags::CLIENT_SECURE_CONNECTION)
        {
            return Err(SyncError::auth("server does not offer secure connection"));
        }

        let capability =
            CapabilityFlags::default_client().intersect(handshake.capability_flags);
        let response = HandshakeResponsePacket {
            capability_flags: capability,
            charset: CHARSET_UTF8_GENERAL_CI,
            username: username.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            auth_plugin_data: handshake.auth_plugin_data.clone(),
        };
        self.write_packet(&response.encode()).await?;
        self.capability = capability;

        let data = self.read_packet().await?;
        match data.first() {
            Some(&PACKET_HEADER_OK) => {
                OkPacket::decode(&data, self.capability)?;
            }
            Some(&PACKET_HEADER_ERR) => {
                let err = ErrPacket::decode(&data, self.capability)?;
                return Err(SyncError::auth(format!(
                    "{} ({})",
                    err.message, err.error_code
                )));
            }
            other => {
                return Err(SyncError::protocol(format!(
                    "unexpected auth response {other:?}"
                )))
            }
        }

        self.info = HandshakeInfo {
            protocol_version: handshake.protocol_version,
            server_version: handshake.server_version,
            connection_id: handshake.connection_id,
        };
        Ok(())
    }

    /// Run a text query and read its response.
    pub async fn exec(&mut self, command: &str) -> Result<QueryResponse> {
        self.reset_sequence();

        let mut w = BinWriter::with_capacity(command.len() + 1);
        w.put_u8(COM_QUERY);
        w.put_string_eof(command);
        self.write_packet(w.as_slice()).await?;

        let data = self.read_packet().await?;
        match data.first() {
            Some(&PACKET_HEADER_OK) => Ok(QueryResponse::Ok(OkPacket::decode(
                &data,
                self.capability,
            )?)),
            Some(&PACKET_HEADER_ERR) => {
                Err(ErrPacket::decode(&data, self.capability)?.into_error())
            }
            Some(&PACKET_HEADER_LOCAL_INFILE) => {
                Err(SyncError::protocol("LOCAL INFILE is not supported"))
            }
            Some(_) => {
                let rs = TextResultSet::read(self, &data).await?;
                Ok(QueryResponse::Rows(rs))
            }
            None => Err(SyncError::protocol("empty query response")),
        }
    }

    /// Register this connection as a slave of the primary.
    pub async fn register_slave(&mut self, rc: &ReplicationConfig, ds: &DataSource) -> Result<()> {
        self.reset_sequence();

        let packet = RegisterSlavePacket {
            server_id: rc.slave_id,
            hostname: rc.report_host.clone(),
            user: ds.username.clone(),
            password: ds.password.clone(),
            ..Default::default()
        };
        self.write_packet(&packet.encode()).await?;

        let data = self.read_packet().await?;
        match data.first() {
            Some(&PACKET_HEADER_OK) => {
                debug!("registered as slave with server_id={}", rc.slave_id);
                Ok(())
            }
            Some(&PACKET_HEADER_ERR) => {
                Err(ErrPacket::decode(&data, self.capability)?.into_error())
            }
            other => Err(SyncError::protocol(format!(
                "unexpected register slave response {other:?}"
            ))),
        }
    }

    /// Ask the primary to start streaming the binlog. The next packets on
    /// this connection are binlog events.
    pub async fn start_dump_binlog(
        &mut self,
        point: &ReplicationPoint,
        slave_id: u32,
    ) -> Result<()> {
        self.reset_sequence();

        let packet = BinlogDumpPacket {
            point: point.clone(),
            // 0x01 would be BINLOG_DUMP_NON_BLOCK; we want the blocking
            // stream.
            flags: 0,
            server_id: slave_id,
        };
        self.write_packet(&packet.encode()).await?;
        info!(
            "requested binlog dump from {}:{}",
            point.filename, point.offset
        );
        Ok(())
    }

    pub(crate) fn capability(&self) -> CapabilityFlags {
        self.capability
    }
}

/// Read one payload, concatenating continuation packets until one shorter
/// than the 2^24-1 limit arrives. Sequence gaps are rejected.
pub(crate) async fn read_packet_from<R: AsyncRead + Unpin>(
    r: &mut R,
    seq: &mut u8,
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    loop {
        let mut header = PacketHeader::default();
        r.read_exact(&mut header.0).await?;

        if header.sequence() != *seq {
            return Err(SyncError::protocol(format!(
                "packet sequence mismatch: got {}, want {}",
                header.sequence(),
                *seq
            )));
        }
        *seq = seq.wrapping_add(1);

        let len = header.length();
        let start = payload.len();
        payload.resize(start + len, 0);
        r.read_exact(&mut payload[start..]).await?;

        if len < MAX_PAYLOAD_LEN {
            return Ok(payload);
        }
    }
}

/// Frame and send one payload, emitting 2^24-1-byte chunks plus a short (or
/// empty) trailer.
pub(crate) async fn write_packet_to<W: AsyncWrite + Unpin>(
    w: &mut W,
    seq: &mut u8,
    payload: &[u8],
) -> Result<()> {
    let mut rest = payload;
    loop {
        let chunk = rest.len().min(MAX_PAYLOAD_LEN);
        let mut header = PacketHeader::default();
        header.set_length(chunk);
        header.set_sequence(*seq);
        *seq = seq.wrapping_add(1);

        w.write_all(&header.0).await?;
        w.write_all(&rest[..chunk]).await?;
        rest = &rest[chunk..];
        if chunk < MAX_PAYLOAD_LEN {
            break;
        }
    }
    w.flush().await?;
    Ok(())
}
