use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    StageContext, StageError, StageHandler, StageOutcome, StageReport,
    list_files,
};
use crate::pipeline::{
    config::LayoutConfig,
    run::{RunRecord, Stage},
};
use crate::storage::StorageHandle;

/// Copies converted output to the destination store and verifies it.
#[derive(Clone, Debug)]
pub struct TransferStage {
    layout: LayoutConfig,
    storage: StorageHandle,
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

async fn checksum(path: PathBuf) -> Result<String, StageError> {
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| StageError::transient(format!("checksum task failed: {e}")))?
        .map_err(StageError::from)
}

/// Compares each copied file against its source and returns the manifest
/// lines (`<sha256>  <relative path>`), or `None` if cancelled part way.
///
/// A mismatch is transient: the next attempt copies over the destination.
pub async fn verify_copies(
    source: &Path,
    destination: &Path,
    files: &[PathBuf],
    ctx: &StageContext,
) -> Result<Option<Vec<String>>, StageError> {
    let mut manifest = Vec::with_capacity(files.len());
    for rel in files {
        if ctx.is_cancelled() {
            return Ok(None);
        }
        let expected = checksum(source.join(rel)).await?;
        let actual = checksum(destination.join(rel)).await?;
        if expected != actual {
            return Err(StageError::transient(format!(
                "checksum mismatch for {}: source {expected}, destination {actual}",
                rel.display()
            )));
        }
        debug!(
            target: "pipeline::stage",
            file = %rel.display(),
            sha256 = %expected,
            "verified"
        );
        manifest.push(format!("{expected}  {}", rel.display()));
    }
    Ok(Some(manifest))
}

fn write_manifest(path: &Path, lines: &[String]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    for line in lines {
        writeln!(tmp, "{line}")?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

impl TransferStage {
    pub const MANIFEST_EXTENSION: &'static str = "sha256";

    pub fn new(layout: LayoutConfig, storage: StorageHandle) -> Self {
        Self { layout, storage }
    }

    pub fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.layout
            .destination_dir
            .join(format!("{run_id}.{}", Self::MANIFEST_EXTENSION))
    }
}

#[async_trait]
impl StageHandler for TransferStage {
    fn stage(&self) -> Stage {
        Stage::Transfer
    }

    async fn execute(
        &self,
        run: &RunRecord,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let snapshot = self.storage.snapshot();
        if snapshot.threshold_breached {
            return Ok(StageOutcome::Deferred {
                reason: "remote storage threshold breached".into(),
                free_bytes: Some(snapshot.free_bytes),
            });
        }

        let run_id = run.run_id.as_str();
        let source = self.layout.staging_for(run_id);
        let destination = self.layout.destination_for(run_id);

        let files = match list_files(&source).await {
            Ok(files) if !files.is_empty() => files,
            Ok(_) => {
                return Err(StageError::permanent(format!(
                    "conversion output {} is empty",
                    source.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StageError::permanent(format!(
                    "conversion output {} is missing",
                    source.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };

        info!(
            target: "pipeline::stage",
            run_id = %run.run_id,
            files = files.len(),
            destination = %destination.display(),
            "starting transfer"
        );

        let mut bytes = 0u64;
        for rel in &files {
            if ctx.is_cancelled() {
                return Ok(StageOutcome::Interrupted);
            }
            let target = destination.join(rel);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            bytes += tokio::fs::copy(source.join(rel), &target).await?;
        }

        let Some(manifest) =
            verify_copies(&source, &destination, &files, ctx).await?
        else {
            return Ok(StageOutcome::Interrupted);
        };

        let manifest_path = self.manifest_path(run_id);
        tokio::task::spawn_blocking(move || {
            write_manifest(&manifest_path, &manifest)
        })
        .await
        .map_err(|e| StageError::transient(format!("manifest task failed: {e}")))??;

        Ok(StageOutcome::Completed(StageReport::detail(format!(
            "{} files ({bytes} bytes) verified at {}",
            files.len(),
            destination.display()
        ))))
    }
}
