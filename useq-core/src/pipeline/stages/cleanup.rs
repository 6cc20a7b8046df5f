use async_trait::async_trait;
use tracing::info;

use super::{StageContext, StageError, StageHandler, StageOutcome, StageReport};
use crate::pipeline::{
    config::LayoutConfig,
    run::{RunRecord, RunStatus, Stage},
};

/// Deletes intermediate conversion output once the transfer is durable.
#[derive(Clone, Debug)]
pub struct CleanupStage {
    layout: LayoutConfig,
}

impl CleanupStage {
    pub fn new(layout: LayoutConfig) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl StageHandler for CleanupStage {
    fn stage(&self) -> Stage {
        Stage::Cleanup
    }

    async fn execute(
        &self,
        run: &RunRecord,
        _ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        // Staging is the only copy until the transfer has been recorded.
        if !matches!(run.status, RunStatus::Transferred | RunStatus::CleaningUp)
        {
            return Err(StageError::permanent(format!(
                "refusing to clean up run in status {}",
                run.status
            )));
        }

        let staging = self.layout.staging_for(run.run_id.as_str());
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => {
                info!(
                    target: "pipeline::stage",
                    run_id = %run.run_id,
                    dir = %staging.display(),
                    "removed conversion staging"
                );
                Ok(StageOutcome::Completed(StageReport::detail(
                    "staging removed",
                )))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(
                StageOutcome::Completed(StageReport::detail("staging already absent")),
            ),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::run::ConversionFlags;
    use crate::types::ids::RunId;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn layout(root: &std::path::Path) -> LayoutConfig {
        LayoutConfig {
            run_roots: vec![root.join("runs")],
            completion_marker: LayoutConfig::DEFAULT_COMPLETION_MARKER.into(),
            staging_dir: root.join("staging"),
            destination_dir: root.join("dest"),
            archive_dir: root.join("archive"),
        }
    }

    fn record(status: RunStatus) -> RunRecord {
        let mut record = RunRecord::discovered(
            RunId::new("R1").unwrap(),
            "/runs/R1".into(),
            ConversionFlags::default(),
        );
        record.status = status;
        record
    }

    #[tokio::test]
    async fn removes_staging_and_tolerates_rerun() {
        let root = TempDir::new().unwrap();
        let layout = layout(root.path());
        std::fs::create_dir_all(layout.staging_for("R1")).unwrap();
        std::fs::write(layout.staging_for("R1").join("a.fastq.gz"), b"x").unwrap();

        let stage = CleanupStage::new(layout.clone());
        let ctx = StageContext::new(CancellationToken::new(), 0);
        let run = record(RunStatus::CleaningUp);

        assert!(matches!(
            stage.execute(&run, &ctx).await.unwrap(),
            StageOutcome::Completed(_)
        ));
        assert!(!layout.staging_for("R1").exists());
        assert!(matches!(
            stage.execute(&run, &ctx).await.unwrap(),
            StageOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn refuses_before_transfer_is_recorded() {
        let root = TempDir::new().unwrap();
        let layout = layout(root.path());
        std::fs::create_dir_all(layout.staging_for("R1")).unwrap();

        let stage = CleanupStage::new(layout.clone());
        let ctx = StageContext::new(CancellationToken::new(), 0);
        let err = stage
            .execute(&record(RunStatus::Transferring), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_permanent());
        assert!(layout.staging_for("R1").exists());
    }
}
