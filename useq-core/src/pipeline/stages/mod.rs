//! Stage handlers: one pipeline step each, safe to re-run after a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::run::{RunRecord, Stage};

pub mod archive;
pub mod cleanup;
pub mod conversion;
pub mod transfer;

pub use archive::ArchiveStage;
pub use cleanup::CleanupStage;
pub use conversion::ConversionStage;
pub use transfer::TransferStage;

/// Run-level failure taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Retried with backoff until attempts are exhausted.
    #[error("transient: {0}")]
    Transient(String),
    /// Fails the run immediately.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, StageError::Permanent(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(msg) | StageError::Permanent(msg) => msg,
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Transient(err.to_string())
    }
}

/// Details a completed stage hands back to the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StageReport {
    pub detail: Option<String>,
    /// New location of the raw run directory, if the stage moved it.
    pub relocated_path: Option<PathBuf>,
}

impl StageReport {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            relocated_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    Completed(StageReport),
    /// Not yet; status and retry count stay as they are.
    Deferred {
        reason: String,
        free_bytes: Option<u64>,
    },
    /// Stopped at a safe checkpoint because shutdown was requested.
    Interrupted,
}

/// Per-execution inputs supplied by the orchestrator.
#[derive(Clone, Debug)]
pub struct StageContext {
    pub cancel: CancellationToken,
    /// Zero-based attempt number for the current stage.
    pub attempt: u16,
}

impl StageContext {
    pub fn new(cancel: CancellationToken, attempt: u16) -> Self {
        Self { cancel, attempt }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn execute(
        &self,
        run: &RunRecord,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError>;
}

/// True when `dir` holds at least one converted FASTQ file, searched
/// recursively.
pub(crate) async fn contains_fastq(dir: &Path) -> std::io::Result<bool> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(next) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&next).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if entry.file_name().to_string_lossy().ends_with(".fastq.gz")
            {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Relative paths of every regular file under `root`, sorted.
pub(crate) async fn list_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let mut entries = tokio::fs::read_dir(root.join(&rel)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let child = rel.join(entry.file_name());
            if file_type.is_dir() {
                pending.push(child);
            } else if file_type.is_file() {
                files.push(child);
            }
        }
    }
    files.sort();
    Ok(files)
}
