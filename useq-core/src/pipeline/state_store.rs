use std::{
    collections::BTreeMap,
    fmt,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::run::{RunRecord, RunStatus};
use crate::error::{PipelineError, Result};
use crate::types::ids::RunId;

/// Durable record of every tracked run, keyed by run id.
///
/// `upsert` must not return until the record is durable: callers act on a
/// status only after it has been persisted.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// All tracked records, terminal ones included.
    async fn load(&self) -> Result<Vec<RunRecord>>;

    async fn upsert(&self, record: &RunRecord) -> Result<()>;

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    /// Non-terminal records, ordered by creation time.
    async fn list_active(&self) -> Result<Vec<RunRecord>>;

    async fn list_by_status(&self, status: RunStatus)
    -> Result<Vec<RunRecord>>;

    async fn contains(&self, run_id: &RunId) -> Result<bool> {
        Ok(self.get(run_id).await?.is_some())
    }
}

/// Operator re-arm: put a failed run back at the status it failed from,
/// persisting before returning.
pub async fn rearm_run<S>(store: &S, run_id: &RunId) -> Result<RunRecord>
where
    S: RunStateStore + ?Sized,
{
    let mut record = store
        .get(run_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(run_id.clone()))?;
    record.rearm()?;
    store.upsert(&record).await?;
    Ok(record)
}

fn sort_by_creation(records: &mut [RunRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

/// File-backed store: one JSON document per run under a state directory.
///
/// Writes go to a temporary file in the same directory which is synced and
/// renamed over the previous document, so a crash leaves either the old or
/// the new record on disk.
#[derive(Clone)]
pub struct JsonFileRunStore {
    dir: PathBuf,
    cache: Arc<RwLock<BTreeMap<RunId, RunRecord>>>,
}

impl fmt::Debug for JsonFileRunStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("JsonFileRunStore");
        debug.field("dir", &self.dir);
        match self.cache.try_read() {
            Ok(cache) => {
                debug.field("records", &cache.len());
            }
            Err(_) => {
                debug.field("records", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl JsonFileRunStore {
    const EXTENSION: &'static str = "json";

    /// Opens (creating if needed) the state directory and reads every record.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let store = Self {
            dir,
            cache: Arc::new(RwLock::new(BTreeMap::new())),
        };
        store.reload().await?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, run_id: &RunId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", run_id.as_str(), Self::EXTENSION))
    }

    /// Re-reads the directory. The cache lock is held throughout so an
    /// upsert cannot land between the read and the swap.
    ///
    /// Documents that do not decode are logged and left out; only I/O
    /// failures fail the reload.
    async fn reload(&self) -> Result<Vec<RunRecord>> {
        let mut cache = self.cache.write().await;
        let mut records = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str())
                != Some(Self::EXTENSION)
            {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(record) => {
                    records.insert(record.run_id.clone(), record);
                }
                Err(err) => {
                    warn!(
                        target: "pipeline::store",
                        path = %path.display(),
                        error = %err,
                        "skipping undecodable run record"
                    );
                }
            }
        }

        debug!(
            target: "pipeline::store",
            dir = %self.dir.display(),
            records = records.len(),
            "loaded run records"
        );

        let mut list: Vec<RunRecord> = records.values().cloned().collect();
        sort_by_creation(&mut list);
        *cache = records;
        Ok(list)
    }
}

fn write_atomically(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|err| PipelineError::Io(err.error))?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(err) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        warn!(
            target: "pipeline::store",
            dir = %dir.display(),
            error = %err,
            "failed to sync state directory"
        );
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[async_trait]
impl RunStateStore for JsonFileRunStore {
    async fn load(&self) -> Result<Vec<RunRecord>> {
        self.reload().await
    }

    async fn upsert(&self, record: &RunRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        let dir = self.dir.clone();
        let target = self.record_path(&record.run_id);

        // Hold the write lock across the disk write so the cache never runs
        // ahead of what is durable.
        let mut cache = self.cache.write().await;
        tokio::task::spawn_blocking(move || {
            write_atomically(&dir, &target, &bytes)
        })
        .await
        .map_err(|err| {
            PipelineError::Internal(format!("state write task failed: {err}"))
        })??;
        cache.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.cache.read().await.get(run_id).cloned())
    }

    /// Reads from disk so records re-armed by another process are seen.
    async fn list_active(&self) -> Result<Vec<RunRecord>> {
        let records = self.reload().await?;
        Ok(records.into_iter().filter(RunRecord::is_active).collect())
    }

    async fn list_by_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self
            .cache
            .read()
            .await
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        sort_by_creation(&mut records);
        Ok(records)
    }
}
