use std::{
    fs, io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use super::{StageContext, StageError, StageHandler, StageOutcome, StageReport};
use crate::pipeline::{
    config::LayoutConfig,
    run::{RunRecord, Stage},
};

/// Moves the raw run directory into long-term storage.
///
/// A same-filesystem move is a single rename. Across filesystems the tree is
/// copied into a hidden partial directory next to the target and renamed into
/// place, so the archive only ever holds complete copies.
#[derive(Clone, Debug)]
pub struct ArchiveStage {
    layout: LayoutConfig,
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn partial_prefix(run_id: &str) -> String {
    format!(".{run_id}.partial-")
}

/// Copy-then-rename relocation used when `rename` crosses devices.
fn relocate_by_copy(
    source: &Path,
    target: &Path,
    run_id: &str,
) -> io::Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let partial =
        parent.join(format!("{}{}", partial_prefix(run_id), Uuid::now_v7()));
    if let Err(err) = copy_tree(source, &partial) {
        if let Err(cleanup) = fs::remove_dir_all(&partial) {
            warn!(
                target: "pipeline::stage",
                run_id,
                path = %partial.display(),
                error = %cleanup,
                "failed to remove partial archive copy; swept on next attempt"
            );
        }
        return Err(err);
    }
    if let Err(err) = fs::File::open(&partial).and_then(|dir| dir.sync_all()) {
        warn!(
            target: "pipeline::stage",
            run_id,
            path = %partial.display(),
            error = %err,
            "failed to sync archive copy"
        );
    }
    fs::rename(&partial, target)?;
    fs::remove_dir_all(source)
}

impl ArchiveStage {
    pub fn new(layout: LayoutConfig) -> Self {
        Self { layout }
    }

    /// Removes partial copies left behind by an interrupted relocation.
    async fn sweep_partials(&self, run_id: &str) -> io::Result<()> {
        let prefix = partial_prefix(run_id);
        let mut entries = match tokio::fs::read_dir(&self.layout.archive_dir).await
        {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                warn!(
                    target: "pipeline::stage",
                    run_id,
                    path = %entry.path().display(),
                    "removing partial archive copy"
                );
                tokio::fs::remove_dir_all(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn relocate(
        &self,
        source: &Path,
        target: &Path,
        run_id: &str,
    ) -> Result<(), StageError> {
        match tokio::fs::rename(source, target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
                info!(
                    target: "pipeline::stage",
                    run_id,
                    "archive is on another filesystem; copying"
                );
                let (source, target, run_id) = (
                    source.to_path_buf(),
                    target.to_path_buf(),
                    run_id.to_string(),
                );
                tokio::task::spawn_blocking(move || {
                    relocate_by_copy(&source, &target, &run_id)
                })
                .await
                .map_err(|e| {
                    StageError::transient(format!("archive copy task failed: {e}"))
                })??;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StageHandler for ArchiveStage {
    fn stage(&self) -> Stage {
        Stage::Archive
    }

    async fn execute(
        &self,
        run: &RunRecord,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        let run_id = run.run_id.as_str();
        let source = run.path.clone();
        let target: PathBuf = self.layout.archive_for(run_id);

        tokio::fs::create_dir_all(&self.layout.archive_dir).await?;
        self.sweep_partials(run_id).await?;

        let source_exists = tokio::fs::try_exists(&source).await?;
        let target_exists = tokio::fs::try_exists(&target).await?;

        match (source_exists, target_exists) {
            (false, true) => {}
            (true, true) if source != target => {
                // The target only appears through an atomic rename of a
                // complete copy, so the leftover source is redundant.
                warn!(
                    target: "pipeline::stage",
                    run_id,
                    source = %source.display(),
                    "archive already complete; removing leftover source"
                );
                tokio::fs::remove_dir_all(&source).await?;
            }
            (true, true) => {}
            (true, false) => {
                if ctx.is_cancelled() {
                    return Ok(StageOutcome::Interrupted);
                }
                self.relocate(&source, &target, run_id).await?;
            }
            (false, false) => {
                return Err(StageError::permanent(format!(
                    "run directory {} missing and not present in archive",
                    source.display()
                )));
            }
        }

        info!(
            target: "pipeline::stage",
            run_id,
            archive = %target.display(),
            "run archived"
        );
        Ok(StageOutcome::Completed(StageReport {
            detail: Some(format!("archived to {}", target.display())),
            relocated_path: Some(target),
        }))
    }
}
