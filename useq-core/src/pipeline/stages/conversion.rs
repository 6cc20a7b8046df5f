use std::{collections::VecDeque, ffi::OsString, path::Path, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, info, warn};

use super::{
    StageContext, StageError, StageHandler, StageOutcome, StageReport,
    contains_fastq,
};
use crate::pipeline::{
    config::{ConversionConfig, LayoutConfig},
    run::{ConversionFlags, RunRecord, Stage},
};

/// Instrument metadata every well-formed run directory carries.
pub const RUN_INFO_FILE: &str = "RunInfo.xml";

/// Highest mismatch count the conversion tool accepts.
pub const MAX_BARCODE_MISMATCHES: u8 = 2;

const STDERR_TAIL_LINES: usize = 20;

/// Invokes the external base-call-to-FASTQ converter for one run.
#[derive(Clone, Debug)]
pub struct ConversionStage {
    config: ConversionConfig,
    layout: LayoutConfig,
}

impl ConversionStage {
    pub fn new(config: ConversionConfig, layout: LayoutConfig) -> Self {
        Self { config, layout }
    }

    /// Tool arguments derived one-to-one from the run's flags.
    pub fn flag_args(flags: &ConversionFlags) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--barcode-mismatches".into(),
            flags.barcode_mismatches.to_string().into(),
        ];
        if flags.allow_missing_bcl {
            args.push("--ignore-missing-bcls".into());
        }
        if flags.emit_index_fastq {
            args.push("--create-fastq-for-index-reads".into());
        }
        if flags.relax_short_reads {
            args.extend([
                "--minimum-trimmed-read-length".into(),
                "0".into(),
                "--mask-short-adapter-reads".into(),
                "0".into(),
            ]);
        }
        args
    }

    fn command(&self, run: &RunRecord, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.extra_args)
            .arg("--runfolder-dir")
            .arg(&run.path)
            .arg("--output-dir")
            .arg(output_dir)
            .args(Self::flag_args(&run.flags))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn preflight(run: &RunRecord) -> Result<(), StageError> {
        if run.flags.barcode_mismatches > MAX_BARCODE_MISMATCHES {
            return Err(StageError::permanent(format!(
                "barcode mismatches {} exceeds the supported maximum of {}",
                run.flags.barcode_mismatches, MAX_BARCODE_MISMATCHES
            )));
        }
        match tokio::fs::metadata(&run.path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StageError::permanent(format!(
                    "run path {} is not a directory",
                    run.path.display()
                )));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageError::permanent(format!(
                    "run directory {} does not exist",
                    run.path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        }
        if !tokio::fs::try_exists(run.path.join(RUN_INFO_FILE)).await? {
            return Err(StageError::permanent(format!(
                "malformed run: {RUN_INFO_FILE} missing from {}",
                run.path.display()
            )));
        }
        Ok(())
    }

    /// Clears output from an earlier attempt so a re-run starts clean.
    async fn prepare_output(output_dir: &Path) -> Result<(), StageError> {
        match tokio::fs::remove_dir_all(output_dir).await {
            Ok(()) => {
                debug!(
                    target: "pipeline::stage",
                    dir = %output_dir.display(),
                    "removed output from previous attempt"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(output_dir).await?;
        Ok(())
    }
}

#[async_trait]
impl StageHandler for ConversionStage {
    fn stage(&self) -> Stage {
        Stage::Conversion
    }

    async fn execute(
        &self,
        run: &RunRecord,
        ctx: &StageContext,
    ) -> Result<StageOutcome, StageError> {
        Self::preflight(run).await?;

        let output_dir = self.layout.staging_for(run.run_id.as_str());
        Self::prepare_output(&output_dir).await?;

        if ctx.is_cancelled() {
            return Ok(StageOutcome::Interrupted);
        }

        let mut cmd = self.command(run, &output_dir);
        info!(
            target: "pipeline::stage",
            run_id = %run.run_id,
            program = %self.config.program,
            attempt = ctx.attempt,
            "starting conversion"
        );
        debug!(target: "pipeline::stage", command = ?cmd, "conversion command");

        let mut child = cmd.spawn().map_err(|e| {
            StageError::transient(format!(
                "failed to start {}: {e}",
                self.config.program
            ))
        })?;

        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancel.cancelled() => None,
        };
        let Some(status) = waited else {
            warn!(
                target: "pipeline::stage",
                run_id = %run.run_id,
                "shutdown requested; stopping conversion"
            );
            if let Err(err) = child.kill().await {
                warn!(
                    target: "pipeline::stage",
                    run_id = %run.run_id,
                    error = %err,
                    "failed to stop conversion process"
                );
            }
            return Ok(StageOutcome::Interrupted);
        };
        let status = status?;

        let stderr = match stderr_tail {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(StageError::transient(format!(
                "{} exited with {code}: {stderr}",
                self.config.program
            )));
        }

        if !contains_fastq(&output_dir).await? {
            return Err(StageError::transient(format!(
                "{} reported success but produced no FASTQ output in {}",
                self.config.program,
                output_dir.display()
            )));
        }

        Ok(StageOutcome::Completed(StageReport::detail(format!(
            "converted into {}",
            output_dir.display()
        ))))
    }
}
