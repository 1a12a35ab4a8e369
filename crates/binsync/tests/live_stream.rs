//! Drives the real wire client and slave engine against a scripted fake
//! primary: handshake, checksum negotiation, heartbeat setup, slave
//! registration and a short CRC32-checksummed binlog dump.

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use binsync::binlog::{BinlogEvent, ColumnValue};
use binsync::codec::BinWriter;
use binsync::protocol::DataSource;
use binsync::rule::SyncRule;
use binsync::slave::{ReplicationConfig, ReplicationPoint, Slave, SlaveStatus};

use support::fixtures;

async fn read_frame(sock: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 4];
    sock.read_exact(&mut header).await.unwrap();
    let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.unwrap();
    (header[3], payload)
}

async fn write_frame(sock: &mut TcpStream, seq: u8, payload: &[u8]) {
    let len = payload.len();
    let header = [
        (len & 0xFF) as u8,
        (len >> 8 & 0xFF) as u8,
        (len >> 16) as u8,
        seq,
    ];
    sock.write_all(&header).await.unwrap();
    sock.write_all(payload).await.unwrap();
    sock.flush().await.unwrap();
}

fn handshake_payload() -> Vec<u8> {
    let mut w = BinWriter::new();
    w.put_u8(10);
    w.put_string_nul("5.7.30-log");
    w.put_u32(7); // connection id
    w.put_bytes(b"abcdefgh");
    w.put_u8(0);
    // PROTOCOL_41 | SECURE_CONNECTION low bits, PLUGIN_AUTH high bits.
    w.put_u16(0x8200);
    w.put_u8(33);
    w.put_u16(0x0002);
    w.put_u16(0x0008);
    w.put_u8(21); // auth plugin data length
    w.put_bytes(&[0u8; 10]);
    w.put_bytes(b"ijklmnopqrst");
    w.put_u8(0);
    w.put_string_nul("mysql_native_password");
    w.into_vec()
}

fn ok_payload() -> Vec<u8> {
    let mut w = BinWriter::new();
    w.put_u8(0x00);
    w.put_u8(0); // affected rows
    w.put_u8(0); // last insert id
    w.put_u16(0x0002); // status
    w.put_u16(0); // warnings
    w.into_vec()
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0, 0, 0x02, 0]
}

fn column_def_payload(name: &str) -> Vec<u8> {
    let mut w = BinWriter::new();
    for s in ["def", "", "", "", name, ""] {
        w.put_u8(s.len() as u8);
        w.put_string_eof(s);
    }
    w.put_u8(0x0C);
    w.put_u16(33);
    w.put_u32(64);
    w.put_u8(253); // VAR_STRING
    w.put_u16(0);
    w.put_u8(0);
    w.into_vec()
}

async fn write_checksum_result(sock: &mut TcpStream, mut seq: u8) {
    write_frame(sock, seq, &[0x01]).await;
    seq += 1;
    write_frame(sock, seq, &column_def_payload("@master_binlog_checksum")).await;
    seq += 1;
    write_frame(sock, seq, &eof_payload()).await;
    seq += 1;
    let mut row = BinWriter::new();
    row.put_u8(5);
    row.put_string_eof("CRC32");
    write_frame(sock, seq, row.as_slice()).await;
    seq += 1;
    write_frame(sock, seq, &eof_payload()).await;
}

/// Speaks just enough of the server side of the protocol for one replica.
async fn run_fake_primary(listener: TcpListener) {
    let (mut sock, _) = listener.accept().await.unwrap();

    // Connection phase.
    write_frame(&mut sock, 0, &handshake_payload()).await;
    let (seq, _response) = read_frame(&mut sock).await;
    write_frame(&mut sock, seq + 1, &ok_payload()).await;

    // Command phase.
    loop {
        let (seq, payload) = read_frame(&mut sock).await;
        match payload.first() {
            Some(0x03) => {
                let sql = String::from_utf8_lossy(&payload[1..]).to_string();
                if sql.contains("SELECT @master_binlog_checksum") {
                    write_checksum_result(&mut sock, seq + 1).await;
                } else {
                    write_frame(&mut sock, seq + 1, &ok_payload()).await;
                }
            }
            Some(0x15) => {
                // COM_REGISTER_SLAVE
                write_frame(&mut sock, seq + 1, &ok_payload()).await;
            }
            Some(0x12) => {
                // COM_BINLOG_DUMP: stream a checksummed fixture binlog,
                // then hold the connection open.
                let events = [
                    fixtures::format_description_packet(true),
                    fixtures::table_map_packet(42, "d", "t", true),
                    fixtures::write_rows_packet(42, 1, "a", true),
                ];
                let mut seq = seq + 1;
                for event in &events {
                    write_frame(&mut sock, seq, event).await;
                    seq = seq.wrapping_add(1);
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                return;
            }
            _ => return,
        }
    }
}

#[tokio::test]
async fn stream_events_from_fake_primary() {
    support::init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_fake_primary(listener));

    let ds = DataSource {
        host: "127.0.0.1".into(),
        port: addr.port(),
        username: "repl".into(),
        password: "secret".into(),
    };
    let rc = ReplicationConfig {
        slave_id: 1001,
        ..ReplicationConfig::default()
    };
    let mut slave = Slave::new(vec![ds], rc, Arc::new(SyncRule::new()));

    slave
        .start(ReplicationPoint {
            filename: "mysql-bin.000001".into(),
            offset: 0, // clamped up to 4
            gtid: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(slave.status(), SlaveStatus::Running);

    let cancel = CancellationToken::new();

    let ev = slave.next(&cancel).await.unwrap();
    assert!(matches!(ev.payload, BinlogEvent::FormatDescription(_)));

    let ev = slave.next(&cancel).await.unwrap();
    let BinlogEvent::TableMap(tm) = &ev.payload else {
        panic!("expected a table map, got {:?}", ev.payload);
    };
    assert_eq!(tm.schema_name, "d");
    assert_eq!(tm.table_name, "t");

    let ev = slave.next(&cancel).await.unwrap();
    let BinlogEvent::Rows(rows) = &ev.payload else {
        panic!("expected a rows event, got {:?}", ev.payload);
    };
    assert_eq!(rows.rows.len(), 1);
    assert_eq!(rows.rows[0].columns[0], ColumnValue::Int32(1));
    assert_eq!(rows.rows[0].columns[1], ColumnValue::String("a".into()));

    // The published point tracks the header log_pos of the last event.
    let point = slave.current_point();
    assert_eq!(point.filename, "mysql-bin.000001");
    assert_eq!(point.offset, 300);

    slave.stop().await;
    assert_eq!(slave.status(), SlaveStatus::Exited);
}

#[tokio::test]
async fn start_fails_fast_against_dead_primary() {
    // Nothing listens here; Start must surface the connection error instead
    // of parking it on the error channel.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ds = DataSource {
        host: "127.0.0.1".into(),
        port: addr.port(),
        username: "repl".into(),
        password: "secret".into(),
    };
    let rc = ReplicationConfig {
        slave_id: 1001,
        ..ReplicationConfig::default()
    };
    let mut slave = Slave::new(vec![ds], rc, Arc::new(SyncRule::new()));
    assert!(slave.start(ReplicationPoint::default()).await.is_err());
    assert_eq!(slave.status(), SlaveStatus::None);
}
