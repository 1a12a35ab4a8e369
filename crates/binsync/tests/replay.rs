//! End-to-end replay over recorded event fixtures: parser -> handler
//! conversion -> dispatcher -> executor, without a live primary.

mod support;

use std::sync::Arc;

use binsync::binlog::{BinlogEvent, ChecksumAlg, EventType, Parser, RowAction};
use binsync::pipeline::build_worker_events;
use binsync::rule::{SyncDesc, SyncRule};
use binsync::slave::ReplicationPoint;
use binsync::worker::{
    partition_index, DispatchPolicy, WorkerConfig, WorkerEventKind, WorkerManager,
};

use support::fixtures;
use support::RecordingExecutor;

#[test]
fn replay_write_rows_to_worker_event() {
    // FormatDescription, TableMap (id=42, d.t, [INT, VARCHAR]), WriteRows
    // with one row (1, "a").
    let mut parser = Parser::new();
    parser
        .parse(&fixtures::format_description_packet(false))
        .unwrap();
    parser
        .parse(&fixtures::table_map_packet(42, "d", "t", false))
        .unwrap();
    let event = parser
        .parse(&fixtures::write_rows_packet(42, 1, "a", false))
        .unwrap();

    let BinlogEvent::Rows(rows) = &event.payload else {
        panic!("expected a rows event, got {:?}", event.payload);
    };
    assert_eq!(rows.action, RowAction::Insert);

    let ti = fixtures::table_info();
    let point = ReplicationPoint {
        filename: "mysql-bin.000001".into(),
        offset: 600,
        gtid: String::new(),
    };
    let jobs = build_worker_events(&event.header, rows, &ti, &point).unwrap();

    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.kind, WorkerEventKind::Insert);
    assert_eq!(job.desc.rewrite_schema, "d");
    assert_eq!(job.desc.rewrite_table, "t");
    assert_eq!(job.columns[0].column.name, "id");
    assert_eq!(job.columns[0].value_text(), "1");
    assert_eq!(job.columns[1].column.name, "name");
    assert_eq!(job.columns[1].value_text(), "a");
    assert_eq!(job.point, point);

    // The dispatch key is the rewritten table name; the worker index is its
    // crc32 over the pool size.
    let key = WorkerManager::dispatch_key(job, DispatchPolicy::TableName).unwrap();
    assert_eq!(key, "d.t");
    let index = partition_index(&key, 4);
    assert!(index < 4);
    assert_eq!(index, partition_index("d.t", 4));
}

#[test]
fn replay_update_rows_pairs_before_and_after() {
    let mut parser = Parser::new();
    parser
        .parse(&fixtures::format_description_packet(false))
        .unwrap();
    parser
        .parse(&fixtures::table_map_packet(42, "d", "t", false))
        .unwrap();
    let event = parser
        .parse(&fixtures::update_rows_packet(42, (1, "a"), (1, "b")))
        .unwrap();

    let BinlogEvent::Rows(rows) = &event.payload else {
        panic!("expected a rows event");
    };
    assert_eq!(rows.action, RowAction::Update);
    assert_eq!(rows.rows.len(), 2);

    let jobs = build_worker_events(
        &event.header,
        rows,
        &fixtures::table_info(),
        &ReplicationPoint::default(),
    )
    .unwrap();

    // Exactly one update event with both images.
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, WorkerEventKind::Update);
    assert_eq!(jobs[0].columns[1].value_text(), "a");
    let new_columns = jobs[0].new_columns.as_ref().unwrap();
    assert_eq!(new_columns[1].value_text(), "b");
}

#[test]
fn replay_with_crc32_checksum_decodes_identically() {
    let mut plain = Parser::new();
    plain
        .parse(&fixtures::format_description_packet(false))
        .unwrap();
    plain
        .parse(&fixtures::table_map_packet(42, "d", "t", false))
        .unwrap();
    let expected = plain
        .parse(&fixtures::write_rows_packet(42, 1, "a", false))
        .unwrap();

    let mut checked = Parser::new();
    checked.set_checksum(ChecksumAlg::Crc32);
    checked
        .parse(&fixtures::format_description_packet(true))
        .unwrap();
    checked
        .parse(&fixtures::table_map_packet(42, "d", "t", true))
        .unwrap();
    let got = checked
        .parse(&fixtures::write_rows_packet(42, 1, "a", true))
        .unwrap();

    let (BinlogEvent::Rows(expected), BinlogEvent::Rows(got)) =
        (&expected.payload, &got.payload)
    else {
        panic!("expected rows events");
    };
    assert_eq!(expected.rows.len(), got.rows.len());
    assert_eq!(expected.rows[0].columns, got.rows[0].columns);
}

#[test]
fn replay_respects_sync_rule() {
    let mut rule = SyncRule::new();
    rule.add_rule(&SyncDesc {
        schema: "d".into(),
        table: "t".into(),
        rewrite_schema: "replica".into(),
        rewrite_table: "t_copy".into(),
        index_keys: vec!["id".into()],
    })
    .unwrap();

    let mut parser = Parser::new();
    parser.set_sync_rule(Arc::new(rule));
    parser
        .parse(&fixtures::format_description_packet(false))
        .unwrap();
    parser
        .parse(&fixtures::table_map_packet(42, "d", "t", false))
        .unwrap();
    parser
        .parse(&fixtures::table_map_packet(43, "d", "ignored", false))
        .unwrap();

    // The ruled table flows through with its rewrite.
    let event = parser
        .parse(&fixtures::write_rows_packet(42, 1, "a", false))
        .unwrap();
    let BinlogEvent::Rows(rows) = &event.payload else {
        panic!("expected a rows event");
    };
    assert_eq!(rows.desc.rewrite_schema, "replica");
    assert_eq!(rows.desc.rewrite_table, "t_copy");

    // The unruled table is filtered before row decoding.
    let event = parser
        .parse(&fixtures::write_rows_packet(43, 2, "b", false))
        .unwrap();
    assert!(matches!(
        event.payload,
        BinlogEvent::Skipped(EventType::WriteRowsV2)
    ));
}

#[tokio::test]
async fn dispatch_delivers_through_executors() {
    let (executor, log) = RecordingExecutor::shared();
    let cfg = WorkerConfig {
        worker_count: 4,
        commit_interval_ms: 10,
        ..WorkerConfig::default()
    };
    let mut manager = WorkerManager::with_executors(&cfg, vec![executor]).unwrap();

    let mut parser = Parser::new();
    parser
        .parse(&fixtures::format_description_packet(false))
        .unwrap();
    parser
        .parse(&fixtures::table_map_packet(42, "d", "t", false))
        .unwrap();
    let event = parser
        .parse(&fixtures::write_rows_packet(42, 7, "x", false))
        .unwrap();
    let BinlogEvent::Rows(rows) = &event.payload else {
        panic!("expected a rows event");
    };

    let jobs = build_worker_events(
        &event.header,
        rows,
        &fixtures::table_info(),
        &ReplicationPoint::default(),
    )
    .unwrap();
    for job in jobs {
        manager.dispatch(job, DispatchPolicy::PrimaryKey).await.unwrap();
    }

    manager.wait_all().await;
    {
        let log = log.lock().await;
        assert_eq!(log.committed.len(), 1);
        assert_eq!(log.committed[0].0, WorkerEventKind::Insert);
        assert_eq!(log.committed[0].1, vec!["7".to_string(), "x".to_string()]);
        assert_eq!(log.begins, log.commits);
        assert_eq!(log.rollbacks, 0);
    }
    manager.stop().await;
}
