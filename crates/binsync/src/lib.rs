//! # binsync - MySQL replication slave emulator and stream processor
//!
//! Connects to a MySQL (or MariaDB) primary over the wire, registers as a
//! replication slave, decodes the binlog event stream into structured
//! row-level change events, filters and rewrites them by rule, fans the
//! work out over a hash-partitioned worker pool, and applies the changes to
//! one or more downstream destinations while durably checkpointing the
//! replication point so replication resumes after a crash.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   packets   ┌─────────┐   events   ┌──────────┐
//! │ primary  │────────────▶│  slave  │───────────▶│ pipeline │
//! │ (binlog) │             │ engine  │  bounded   │ handler  │
//! └──────────┘             └─────────┘   queue    └────┬─────┘
//!                                                      │ crc32(key) % N
//!                                      ┌───────────────┼───────────────┐
//!                                      ▼               ▼               ▼
//!                                 ┌─────────┐     ┌─────────┐     ┌─────────┐
//!                                 │ worker 0│     │ worker 1│ ... │ worker N│
//!                                 └────┬────┘     └────┬────┘     └────┬────┘
//!                                      └───── begin/exec*/commit ──────┘
//! ```
//!
//! Ordering is preserved per partition key; the replication point is
//! persisted only after a dispatch barrier has drained every worker, which
//! yields at-least-once delivery (the MySQL destination rewrites inserts as
//! `REPLACE INTO` to stay idempotent).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> binsync::Result<()> {
//! use std::sync::Arc;
//! use binsync::protocol::DataSource;
//! use binsync::rule::SyncRule;
//! use binsync::slave::{ReplicationConfig, ReplicationPoint, Slave};
//!
//! let source = DataSource {
//!     host: "127.0.0.1".into(),
//!     port: 3306,
//!     username: "repl".into(),
//!     password: "secret".into(),
//! };
//! let rc = ReplicationConfig { slave_id: 1001, ..ReplicationConfig::default() };
//! let mut slave = Slave::new(vec![source], rc, Arc::new(SyncRule::new()));
//! slave.start(ReplicationPoint::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod binlog;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod rule;
pub mod slave;
pub mod tableinfo;
pub mod worker;

pub use config::AppConfig;
pub use error::{Result, SyncError};
pub use pipeline::Pipeline;
pub use slave::{ReplicationConfig, ReplicationPoint, Slave};
pub use worker::{DispatchPolicy, WorkerManager};
