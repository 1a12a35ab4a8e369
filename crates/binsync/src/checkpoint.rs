//! Durable checkpointing of the replication point.
//!
//! A small key/value store persisted as a single JSON dictionary, written
//! atomically (temp file, fsync, rename). Writes are coalesced by a lazy
//! save threshold; barrier-time writes may still be in-memory-only until an
//! explicit `save`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::slave::ReplicationPoint;

/// Storage-source scheme selecting [`LocalStore`].
pub const LOCAL_STORE_SCHEME: &str = "ls";

const POINT_KEY: &str = "replication_point";
const LAZY_SAVE_THRESHOLD: Duration = Duration::from_secs(30);

/// A persistent string-keyed JSON store.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Make the current contents durable.
    async fn save(&self) -> Result<()>;
}

/// JSON-dictionary store backed by a local file.
pub struct LocalStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, serde_json::Value>>,
}

impl LocalStore {
    /// Open the store, loading the existing file when present.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(SyncError::Io(e)),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        let data = {
            let entries = self.entries.lock().await;
            serde_json::to_vec(&*entries)?
        };

        // Temp file + fsync + rename keeps a crash from leaving a torn
        // checkpoint file.
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("checkpoint store saved to {:?}", self.path);
        Ok(())
    }
}

/// Open a store from a `storage-source` string such as `ls:/var/lib/binsync.json`.
pub async fn open_store(source: &str) -> Result<Box<dyn Store>> {
    let (scheme, value) = source.split_once(':').ok_or_else(|| {
        SyncError::config(format!("invalid storage-source {source:?}"))
    })?;
    if value.is_empty() {
        return Err(SyncError::config(format!(
            "invalid storage-source {source:?}"
        )));
    }
    match scheme.to_ascii_lowercase().as_str() {
        LOCAL_STORE_SCHEME => Ok(Box::new(LocalStore::open(value).await?)),
        other => Err(SyncError::config(format!("unknown storage type {other}"))),
    }
}

/// Reads and writes the replication point through a [`Store`], coalescing
/// disk writes with a lazy-save threshold.
pub struct PointStore {
    store: Box<dyn Store>,
    last_save: Mutex<tokio::time::Instant>,
    lazy_threshold: Duration,
}

impl PointStore {
    pub fn new(store: Box<dyn Store>) -> Self {
        Self {
            store,
            last_save: Mutex::new(tokio::time::Instant::now()),
            lazy_threshold: LAZY_SAVE_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_lazy_threshold(mut self, threshold: Duration) -> Self {
        self.lazy_threshold = threshold;
        self
    }

    /// The persisted replication point, if any.
    pub async fn read_point(&self) -> Result<Option<ReplicationPoint>> {
        match self.store.get(POINT_KEY).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Record the point in the store, flushing to disk only once the lazy
    /// threshold has elapsed.
    pub async fn write_point(&self, point: &ReplicationPoint) -> Result<()> {
        self.store
            .set(POINT_KEY, serde_json::to_value(point)?)
            .await?;

        let mut last_save = self.last_save.lock().await;
        if last_save.elapsed() > self.lazy_threshold {
            self.store.save().await?;
            *last_save = tokio::time::Instant::now();
        }
        Ok(())
    }

    /// Force the store to disk.
    pub async fn save(&self) -> Result<()> {
        self.store.save().await?;
        *self.last_save.lock().await = tokio::time::Instant::now();
        Ok(())
    }
}
