use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::types::ids::RunId;

/// Pipeline status of a tracked run.
///
/// Statuses advance strictly along the forward chain returned by
/// [`RunStatus::next`]; `Failed` is reachable from any non-terminal status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Discovered,
    Converting,
    Converted,
    Transferring,
    Transferred,
    CleaningUp,
    Archiving,
    Archived,
    Failed,
}

pub const ALL_RUN_STATUSES: [RunStatus; 9] = [
    RunStatus::Discovered,
    RunStatus::Converting,
    RunStatus::Converted,
    RunStatus::Transferring,
    RunStatus::Transferred,
    RunStatus::CleaningUp,
    RunStatus::Archiving,
    RunStatus::Archived,
    RunStatus::Failed,
];

impl RunStatus {
    pub fn next(self) -> Option<RunStatus> {
        match self {
            RunStatus::Discovered => Some(RunStatus::Converting),
            RunStatus::Converting => Some(RunStatus::Converted),
            RunStatus::Converted => Some(RunStatus::Transferring),
            RunStatus::Transferring => Some(RunStatus::Transferred),
            RunStatus::Transferred => Some(RunStatus::CleaningUp),
            RunStatus::CleaningUp => Some(RunStatus::Archiving),
            RunStatus::Archiving => Some(RunStatus::Archived),
            RunStatus::Archived | RunStatus::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Archived | RunStatus::Failed)
    }

    /// Stage the orchestrator dispatches for a run resting in this status.
    pub fn stage(self) -> Option<Stage> {
        match self {
            RunStatus::Discovered | RunStatus::Converting => {
                Some(Stage::Conversion)
            }
            RunStatus::Converted | RunStatus::Transferring => {
                Some(Stage::Transfer)
            }
            RunStatus::Transferred | RunStatus::CleaningUp => {
                Some(Stage::Cleanup)
            }
            RunStatus::Archiving => Some(Stage::Archive),
            RunStatus::Archived | RunStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, target: RunStatus) -> bool {
        if target == RunStatus::Failed {
            return !self.is_terminal();
        }
        self.next() == Some(target)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Discovered => "discovered",
            RunStatus::Converting => "converting",
            RunStatus::Converted => "converted",
            RunStatus::Transferring => "transferring",
            RunStatus::Transferred => "transferred",
            RunStatus::CleaningUp => "cleaning_up",
            RunStatus::Archiving => "archiving",
            RunStatus::Archived => "archived",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_RUN_STATUSES
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                PipelineError::Internal(format!("unknown run status '{s}'"))
            })
    }
}

/// One pipeline step with its own success/failure/retry policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Conversion,
    Transfer,
    Cleanup,
    Archive,
}

impl Stage {
    /// Status written ahead of executing the stage.
    pub fn in_progress_status(self) -> RunStatus {
        match self {
            Stage::Conversion => RunStatus::Converting,
            Stage::Transfer => RunStatus::Transferring,
            Stage::Cleanup => RunStatus::CleaningUp,
            Stage::Archive => RunStatus::Archiving,
        }
    }

    /// Status persisted once the stage has completed.
    pub fn success_status(self) -> RunStatus {
        match self {
            Stage::Conversion => RunStatus::Converted,
            Stage::Transfer => RunStatus::Transferred,
            Stage::Cleanup => RunStatus::Archiving,
            Stage::Archive => RunStatus::Archived,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Conversion => write!(f, "conversion"),
            Stage::Transfer => write!(f, "transfer"),
            Stage::Cleanup => write!(f, "cleanup"),
            Stage::Archive => write!(f, "archive"),
        }
    }
}

/// Per-run conversion configuration, fixed at registration time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionFlags {
    /// Tolerate missing intermediate base-call files.
    pub allow_missing_bcl: bool,
    /// Mismatches allowed in index reads while demultiplexing.
    pub barcode_mismatches: u8,
    /// Emit FASTQ records for index reads.
    pub emit_index_fastq: bool,
    /// Drop minimum trimmed length and short adapter masking to zero.
    pub relax_short_reads: bool,
}

impl Default for ConversionFlags {
    fn default() -> Self {
        Self {
            allow_missing_bcl: false,
            barcode_mismatches: 1,
            emit_index_fastq: false,
            relax_short_reads: false,
        }
    }
}

/// Durable record of one sequencing run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub path: PathBuf,
    pub status: RunStatus,
    pub flags: ConversionFlags,
    pub retry_count: u16,
    pub last_error: Option<String>,
    /// Status the run failed from; consumed by operator re-arm.
    #[serde(default)]
    pub failed_from: Option<RunStatus>,
    /// Earliest time the orchestrator may dispatch the run again.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn discovered(
        run_id: RunId,
        path: PathBuf,
        flags: ConversionFlags,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            path,
            status: RunStatus::Discovered,
            flags,
            retry_count: 0,
            last_error: None,
            failed_from: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Advances along the forward chain. Entering a new status resets the
    /// retry bookkeeping.
    pub fn advance_to(&mut self, target: RunStatus) -> Result<()> {
        if target == RunStatus::Failed
            || !self.status.can_transition_to(target)
        {
            return Err(self.invalid(target));
        }
        self.status = target;
        self.retry_count = 0;
        self.last_error = None;
        self.next_attempt_at = None;
        self.touch();
        Ok(())
    }

    /// Writes the stage's in-progress status if the run is still resting in
    /// the stage's entry status. Returns `false` when already in progress.
    pub fn begin_stage(&mut self, stage: Stage) -> Result<bool> {
        let target = stage.in_progress_status();
        if self.status == target {
            return Ok(false);
        }
        if self.status.stage() != Some(stage) {
            return Err(self.invalid(target));
        }
        self.advance_to(target)?;
        Ok(true)
    }

    pub fn record_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
        self.next_attempt_at = next_attempt_at;
        self.touch();
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        if !self.status.can_transition_to(RunStatus::Failed) {
            return Err(self.invalid(RunStatus::Failed));
        }
        self.failed_from = Some(self.status);
        self.status = RunStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        self.touch();
        Ok(())
    }

    /// Operator action: put a failed run back where it failed.
    pub fn rearm(&mut self) -> Result<RunStatus> {
        let Some(resume_at) = self.failed_from else {
            return Err(self.invalid(RunStatus::Discovered));
        };
        if self.status != RunStatus::Failed {
            return Err(self.invalid(resume_at));
        }
        self.status = resume_at;
        self.failed_from = None;
        self.retry_count = 0;
        self.last_error = None;
        self.next_attempt_at = None;
        self.touch();
        Ok(resume_at)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: RunStatus) -> PipelineError {
        PipelineError::InvalidTransition {
            run_id: self.run_id.clone(),
            from: self.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RunRecord {
        RunRecord::discovered(
            RunId::new("R1").expect("id"),
            PathBuf::from("/runs/R1"),
            ConversionFlags::default(),
        )
    }

    #[test]
    fn forward_chain_reaches_archived() {
        let mut status = RunStatus::Discovered;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            status = next;
            seen.push(status);
        }
        assert_eq!(status, RunStatus::Archived);
        assert_eq!(seen.len(), 8);
        assert!(!seen.contains(&RunStatus::Failed));
    }

    #[test]
    fn advance_rejects_skips_and_reversals() {
        let mut run = record();
        assert!(run.advance_to(RunStatus::Converted).is_err());
        run.advance_to(RunStatus::Converting).expect("forward");
        assert!(run.advance_to(RunStatus::Discovered).is_err());
        assert_eq!(run.status, RunStatus::Converting);
    }

    #[test]
    fn advancing_resets_retry_bookkeeping() {
        let mut run = record();
        run.begin_stage(Stage::Conversion).expect("begin");
        run.record_retry("tool crashed", Some(Utc::now()));
        assert_eq!(run.retry_count, 1);
        run.advance_to(RunStatus::Converted).expect("advance");
        assert_eq!(run.retry_count, 0);
        assert!(run.last_error.is_none());
        assert!(run.next_attempt_at.is_none());
    }

    #[test]
    fn begin_stage_is_idempotent_for_in_progress_runs() {
        let mut run = record();
        assert!(run.begin_stage(Stage::Conversion).expect("first"));
        assert!(!run.begin_stage(Stage::Conversion).expect("second"));
        assert!(run.begin_stage(Stage::Transfer).is_err());
    }

    #[test]
    fn cleanup_completion_enters_archiving() {
        assert_eq!(Stage::Cleanup.success_status(), RunStatus::Archiving);
        assert_eq!(RunStatus::Archiving.stage(), Some(Stage::Archive));
        for stage in [
            Stage::Conversion,
            Stage::Transfer,
            Stage::Cleanup,
            Stage::Archive,
        ] {
            assert_eq!(
                stage.in_progress_status().next(),
                Some(stage.success_status())
            );
        }
    }

    #[test]
    fn failed_runs_rearm_to_their_failing_status() {
        let mut run = record();
        run.begin_stage(Stage::Conversion).expect("begin");
        run.record_retry("boom", None);
        run.fail("retries exhausted").expect("fail");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.fail("again").is_err());

        let resumed = run.rearm().expect("rearm");
        assert_eq!(resumed, RunStatus::Converting);
        assert_eq!(run.retry_count, 0);
        assert!(run.last_error.is_none());
        assert!(run.rearm().is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ALL_RUN_STATUSES {
            assert_eq!(status.as_str().parse::<RunStatus>().ok(), Some(status));
        }
    }
}
