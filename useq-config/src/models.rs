use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use useq_core::{
    notify::NotificationConfig,
    pipeline::{
        ConversionConfig, LayoutConfig, OrchestratorConfig,
        StorageMonitorConfig,
    },
};

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub layout: LayoutConfig,
    pub state: StateConfig,
    pub orchestrator: OrchestratorConfig,
    pub conversion: ConversionConfig,
    pub storage: StorageConfig,
    pub notifications: NotificationConfig,
    pub metadata: ConfigMetadata,
}

impl DaemonConfig {
    /// Create the directories the stages write into.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.layout.staging_dir)?;
        std::fs::create_dir_all(&self.layout.destination_dir)?;
        std::fs::create_dir_all(&self.layout.archive_dir)?;
        if let StateConfig::File { dir } = &self.state {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Where run records are persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StateConfig {
    /// One JSON document per run under `dir`.
    File { dir: PathBuf },
    /// `sequencing_runs` table; needs the daemon's `postgres` feature.
    Postgres { url: String },
}

impl StateConfig {
    pub const DEFAULT_DIR: &'static str = "state";

    pub fn file_dir(&self) -> Option<&Path> {
        match self {
            StateConfig::File { dir } => Some(dir),
            StateConfig::Postgres { .. } => None,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig::File {
            dir: PathBuf::from(Self::DEFAULT_DIR),
        }
    }
}

impl fmt::Debug for StateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateConfig::File { dir } => {
                f.debug_struct("File").field("dir", dir).finish()
            }
            StateConfig::Postgres { .. } => f
                .debug_struct("Postgres")
                .field("url", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    /// Remote capacity endpoint. Without it the monitor is not started and
    /// transfers are never gated.
    pub nextcloud: Option<NextcloudConfig>,
    pub monitor: StorageMonitorConfig,
}

#[derive(Clone)]
pub struct NextcloudConfig {
    pub base_url: String,
    pub user: String,
    pub password: String,
    pub timeout: Duration,
}

impl NextcloudConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
}

impl fmt::Debug for NextcloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextcloudConfig")
            .field("base_url", &self.base_url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
