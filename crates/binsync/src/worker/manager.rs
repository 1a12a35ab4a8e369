//! The dispatcher: partitioning, the in-flight tracker and the checkpoint
//! barrier.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{Result, SyncError};
use crate::tableinfo::table_key;
use crate::worker::executor::create_executors;
use crate::worker::worker::{Worker, WorkerStatus};
use crate::worker::{DispatchPolicy, WorkerConfig, WorkerEvent};

const MIN_WORKER_COUNT: usize = 1;
const WORKER_JOB_CHANNEL_SIZE: usize = 2560;
/// Seconds between checkpoint barriers.
const POINT_SAVE_INTERVAL: Duration = Duration::from_secs(15);

/// Counts dispatched-but-uncommitted events; the barrier waits for zero.
#[derive(Default)]
pub struct JobTracker {
    count: AtomicU64,
    notify: Notify,
}

impl JobTracker {
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self, n: u64) {
        let prev = self.count.fetch_sub(n, Ordering::AcqRel);
        if prev == n {
            self.notify.notify_waiters();
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until every tracked event has been committed.
    pub async fn wait(&self) {
        loop {
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a concurrent `done` cannot
            // slip between them.
            notified.as_mut().enable();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The stable partition of a dispatch key over `n` workers.
pub fn partition_index(key: &str, n: usize) -> usize {
    crc32fast::hash(key.as_bytes()) as usize % n.max(1)
}

struct WorkerHandle {
    tx: Option<mpsc::Sender<WorkerEvent>>,
    status: Arc<AtomicI64>,
    join: Option<JoinHandle<()>>,
}

/// Owns the worker pool and shards [`WorkerEvent`]s across it.
pub struct WorkerManager {
    handles: Vec<WorkerHandle>,
    tracker: Arc<JobTracker>,
    last_point_time: Instant,
    point_save_interval: Duration,
}

impl WorkerManager {
    /// Build the pool and its executors from configuration.
    pub async fn new(cfg: &WorkerConfig) -> Result<Self> {
        if cfg.tos.is_empty() {
            return Err(SyncError::config("worker.tos has no destinations"));
        }
        let executors = create_executors(&cfg.tos).await?;
        Self::with_executors(cfg, executors)
    }

    /// Build the pool around pre-built executors. The factory seam for
    /// embedders and tests.
    pub fn with_executors(
        cfg: &WorkerConfig,
        executors: Vec<crate::worker::SharedExecutor>,
    ) -> Result<Self> {
        let mut worker_count = cfg.worker_count;
        if worker_count < MIN_WORKER_COUNT {
            warn!("minimal worker count is {MIN_WORKER_COUNT}");
            worker_count = MIN_WORKER_COUNT;
        }
        if executors.is_empty() {
            return Err(SyncError::config("worker pool has no executors"));
        }

        let tracker = Arc::new(JobTracker::default());
        let (queue_size, commit_interval, retry_interval) = Worker::settings(cfg);

        let mut handles = Vec::with_capacity(worker_count);
        for wid in 0..worker_count {
            let (tx, rx) = mpsc::channel(WORKER_JOB_CHANNEL_SIZE);
            let status = Arc::new(AtomicI64::new(WorkerStatus::None as i64));
            let worker = Worker {
                wid,
                rx,
                executors: executors.clone(),
                tracker: tracker.clone(),
                status: status.clone(),
                queue_size,
                commit_interval,
                retry_interval,
                max_retries: cfg.max_commit_retries,
            };
            handles.push(WorkerHandle {
                tx: Some(tx),
                status,
                join: Some(tokio::spawn(worker.run())),
            });
        }

        Ok(Self {
            handles,
            tracker,
            last_point_time: Instant::now(),
            point_save_interval: POINT_SAVE_INTERVAL,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn worker_status(&self, wid: usize) -> Option<WorkerStatus> {
        self.handles
            .get(wid)
            .map(|h| WorkerStatus::from_i64(h.status.load(Ordering::SeqCst)))
    }

    #[cfg(test)]
    pub(crate) fn set_point_save_interval(&mut self, interval: Duration) {
        self.point_save_interval = interval;
    }

    /// The dispatch key of an event under the given policy.
    pub fn dispatch_key(event: &WorkerEvent, policy: DispatchPolicy) -> Result<String> {
        let key = match policy {
            DispatchPolicy::TableName => {
                table_key(&event.desc.rewrite_schema, &event.desc.rewrite_table)
            }
            DispatchPolicy::PrimaryKey => {
                let mut parts = Vec::with_capacity(event.table.index_columns.len());
                for &idx in &event.table.index_columns {
                    let column = event.columns.get(idx).ok_or_else(|| {
                        SyncError::schema(format!(
                            "index column {idx} out of range for {}.{}",
                            event.table.schema, event.table.name
                        ))
                    })?;
                    parts.push(column.value_text());
                }
                parts.join(",")
            }
        };
        if key.is_empty() || key == "." {
            return Err(SyncError::invalid_state(format!(
                "cannot derive dispatch key for {}.{} under {policy:?}",
                event.table.schema, event.table.name
            )));
        }
        Ok(key)
    }

    /// Shard one event to its worker. Returns true when a checkpoint
    /// barrier completed, i.e. every dispatched event has been committed
    /// and the replication point may be persisted.
    pub async fn dispatch(&mut self, event: WorkerEvent, policy: DispatchPolicy) -> Result<bool> {
        let key = Self::dispatch_key(&event, policy)?;
        let index = partition_index(&key, self.handles.len());

        let tx = self.handles[index].tx.as_ref().ok_or_else(|| {
            SyncError::invalid_state(format!("worker {index} input closed"))
        })?;
        self.tracker.add(1);
        if tx.send(event).await.is_err() {
            self.tracker.done(1);
            return Err(SyncError::invalid_state(format!(
                "worker {index} input closed"
            )));
        }

        if self.last_point_time.elapsed() > self.point_save_interval {
            self.tracker.wait().await;
            self.last_point_time = Instant::now();
            return Ok(true);
        }
        Ok(false)
    }

    /// Block until every worker's queued and in-flight events are
    /// committed.
    pub async fn wait_all(&self) {
        self.tracker.wait().await;
    }

    /// Drain, close worker inputs and join the pool. In-flight commits are
    /// never aborted.
    pub async fn stop(mut self) {
        self.tracker.wait().await;
        for handle in self.handles.iter_mut() {
            // Dropping the sender closes the worker's input.
            handle.tx.take();
        }
        for handle in self.handles.iter_mut() {
            if let Some(join) = handle.join.take() {
                let _ = join.await;
            }
        }
    }
}
