//! A single worker: bounded pending queue, interval-driven flush and the
//! indefinite commit retry loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::Result;
use crate::worker::executor::SharedExecutor;
use crate::worker::manager::JobTracker;
use crate::worker::{WorkerConfig, WorkerEvent};

pub(crate) const DEFAULT_QUEUE_SIZE: usize = 20;
pub(crate) const DEFAULT_COMMIT_INTERVAL_MS: u64 = 200;
pub(crate) const DEFAULT_RETRY_INTERVAL_MS: u64 = 2000;
const IDLE_SLEEP: Duration = Duration::from_millis(20);

/// Public worker status; flips to `Abnormal` while commit retries run and
/// recovers silently on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum WorkerStatus {
    None = 0,
    Running = 1,
    Abnormal = 2,
    Exited = 3,
}

impl WorkerStatus {
    pub(crate) fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::Abnormal,
            3 => Self::Exited,
            _ => Self::None,
        }
    }
}

pub(crate) struct Worker {
    pub(crate) wid: usize,
    pub(crate) rx: mpsc::Receiver<WorkerEvent>,
    pub(crate) executors: Vec<SharedExecutor>,
    pub(crate) tracker: Arc<JobTracker>,
    pub(crate) status: Arc<AtomicI64>,
    pub(crate) queue_size: usize,
    pub(crate) commit_interval: Duration,
    pub(crate) retry_interval: Duration,
    pub(crate) max_retries: Option<u64>,
}

impl Worker {
    pub(crate) fn settings(cfg: &WorkerConfig) -> (usize, Duration, Duration) {
        let queue_size = if cfg.queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            cfg.queue_size
        };
        let commit_interval = Duration::from_millis(if cfg.commit_interval_ms == 0 {
            DEFAULT_COMMIT_INTERVAL_MS
        } else {
            cfg.commit_interval_ms
        });
        let retry_interval = Duration::from_millis(if cfg.retry_interval_ms == 0 {
            DEFAULT_RETRY_INTERVAL_MS
        } else {
            cfg.retry_interval_ms
        });
        (queue_size, commit_interval, retry_interval)
    }

    pub(crate) async fn run(mut self) {
        self.status
            .store(WorkerStatus::Running as i64, Ordering::SeqCst);

        let mut queue: Vec<WorkerEvent> = Vec::with_capacity(self.queue_size);
        let mut last_commit = Instant::now();

        loop {
            match self.rx.try_recv() {
                Ok(job) => {
                    queue.push(job);
                    if queue.len() >= self.queue_size {
                        if self.commit_queue(&mut queue, &mut last_commit).await.is_err() {
                            break;
                        }
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if !queue.is_empty() && last_commit.elapsed() >= self.commit_interval {
                        if self.commit_queue(&mut queue, &mut last_commit).await.is_err() {
                            break;
                        }
                    } else {
                        sleep(IDLE_SLEEP).await;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    // Inputs are closed only after the in-flight tracker
                    // drains, so the queue is normally empty here.
                    if !queue.is_empty() {
                        let _ = self.commit_queue(&mut queue, &mut last_commit).await;
                    }
                    info!("worker {} stop", self.wid);
                    break;
                }
            }
        }

        self.status
            .store(WorkerStatus::Exited as i64, Ordering::SeqCst);
    }

    async fn commit_queue(
        &self,
        queue: &mut Vec<WorkerEvent>,
        last_commit: &mut Instant,
    ) -> Result<()> {
        for executor in &self.executors {
            self.commit_to_executor(executor, queue).await?;
        }

        self.status
            .store(WorkerStatus::Running as i64, Ordering::SeqCst);
        self.tracker.done(queue.len() as u64);
        queue.clear();
        *last_commit = Instant::now();
        Ok(())
    }

    /// Apply the batch to one executor inside a transaction, retrying with
    /// backoff until it lands (or the configured retry cap is hit).
    async fn commit_to_executor(
        &self,
        executor: &SharedExecutor,
        jobs: &[WorkerEvent],
    ) -> Result<()> {
        let mut executor = executor.lock().await;
        let mut retry_times = 0u64;

        loop {
            let err = match self.try_batch(executor.as_mut(), jobs).await {
                Ok(()) => {
                    self.status
                        .store(WorkerStatus::Running as i64, Ordering::SeqCst);
                    return Ok(());
                }
                Err(e) => e,
            };

            self.status
                .store(WorkerStatus::Abnormal as i64, Ordering::SeqCst);
            retry_times += 1;
            if let Some(max) = self.max_retries {
                if retry_times > max {
                    return Err(err);
                }
            }
            error!(
                "worker {} commit error: {err}, retry {retry_times}",
                self.wid
            );
            sleep(self.retry_interval).await;
        }
    }

    async fn try_batch(
        &self,
        executor: &mut (dyn crate::worker::Executor),
        jobs: &[WorkerEvent],
    ) -> Result<()> {
        executor.begin().await?;
        for job in jobs {
            if let Err(e) = executor.exec(job).await {
                if let Err(rerr) = executor.rollback().await {
                    error!("worker {} rollback error: {rerr}", self.wid);
                }
                return Err(e);
            }
        }
        executor.commit().await
    }
}
