use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use super::run::{ConversionFlags, Stage};

/// Global knobs that tune orchestrator behaviour.
///
/// All fields carry defaults so a deployment only needs to supply the values
/// it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cycle cadence and worker pool sizing.
    pub cycle: CycleConfig,
    /// Retry/backoff policy shared by all stages.
    pub retry: RetryConfig,
    /// Per-stage execution timeouts.
    pub timeouts: StageTimeouts,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Delay between orchestration cycles (ms).
    pub interval_ms: u64,
    /// Maximum stage executions in flight across all runs.
    pub max_parallel_stages: usize,
    /// How long shutdown waits for in-flight stages before abandoning them (ms).
    pub shutdown_grace_ms: u64,
}

impl CycleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            max_parallel_stages: 2,
            shutdown_grace_ms: 30_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts allowed per stage before the run is marked failed.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 60_000,
            backoff_max_ms: 60 * 60 * 1_000,
            jitter_ratio: 0.1,
            jitter_min_ms: 1_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub conversion_secs: u64,
    pub transfer_secs: u64,
    pub cleanup_secs: u64,
    pub archive_secs: u64,
}

impl StageTimeouts {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        let secs = match stage {
            Stage::Conversion => self.conversion_secs,
            Stage::Transfer => self.transfer_secs,
            Stage::Cleanup => self.cleanup_secs,
            Stage::Archive => self.archive_secs,
        };
        Duration::from_secs(secs)
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            conversion_secs: 12 * 60 * 60,
            transfer_secs: 6 * 60 * 60,
            cleanup_secs: 30 * 60,
            archive_secs: 2 * 60 * 60,
        }
    }
}

/// Filesystem layout the scanner and stages operate on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Directories whose immediate children are sequencer run directories.
    pub run_roots: Vec<PathBuf>,
    /// File whose presence marks a run directory as fully written.
    pub completion_marker: String,
    /// Conversion output, one subdirectory per run.
    pub staging_dir: PathBuf,
    /// Destination store receiving verified copies of converted output.
    pub destination_dir: PathBuf,
    /// Long-term location for raw run directories.
    pub archive_dir: PathBuf,
}

impl LayoutConfig {
    pub const DEFAULT_COMPLETION_MARKER: &'static str = "RTAComplete.txt";

    pub fn staging_for(&self, run_id: &str) -> PathBuf {
        self.staging_dir.join(run_id)
    }

    pub fn destination_for(&self, run_id: &str) -> PathBuf {
        self.destination_dir.join(run_id)
    }

    pub fn archive_for(&self, run_id: &str) -> PathBuf {
        self.archive_dir.join(run_id)
    }
}

/// External conversion tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub program: String,
    /// Arguments placed before the generated flags.
    pub extra_args: Vec<String>,
    /// Flags applied to newly registered runs.
    pub default_flags: ConversionFlags,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            program: "bcl2fastq".to_string(),
            extra_args: Vec::new(),
            default_flags: ConversionFlags::default(),
        }
    }
}

/// Threshold and cadence for the remote storage monitor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageMonitorConfig {
    /// Breach when free space drops to or below this many bytes.
    pub threshold_bytes: u64,
    /// Free space must exceed `threshold_bytes + clear_margin_bytes` to clear.
    pub clear_margin_bytes: u64,
    pub poll_interval_ms: u64,
}

impl StorageMonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for StorageMonitorConfig {
    fn default() -> Self {
        const TIB: u64 = 1024 * 1024 * 1024 * 1024;
        Self {
            threshold_bytes: 10 * TIB,
            clear_margin_bytes: TIB,
            poll_interval_ms: 15 * 60 * 1_000,
        }
    }
}
