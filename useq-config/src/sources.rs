use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use useq_core::pipeline::{ConversionFlags, OrchestratorConfig};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub layout: FileLayoutConfig,
    #[serde(default)]
    pub state: FileStateConfig,
    pub orchestrator: Option<OrchestratorConfig>,
    #[serde(default)]
    pub conversion: FileConversionConfig,
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub notifications: FileNotificationConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLayoutConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_roots: Option<Vec<PathBuf>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_marker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    File,
    Postgres,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStateConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StateBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileConversionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_flags: Option<ConversionFlags>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStorageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_margin_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileNotificationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipients: Option<Vec<String>>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub run_roots: Option<Vec<PathBuf>>,
    pub completion_marker: Option<String>,
    pub staging_dir: Option<PathBuf>,
    pub destination_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub conversion_program: Option<String>,
    pub cycle_interval_ms: Option<u64>,
    pub max_parallel_stages: Option<usize>,
    pub nextcloud_url: Option<String>,
    pub nextcloud_user: Option<String>,
    pub nextcloud_password: Option<String>,
    pub nextcloud_password_file: Option<PathBuf>,
    pub storage_threshold_bytes: Option<u64>,
    pub notify_sender: Option<String>,
    pub notify_recipients: Option<Vec<String>>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).filter(|value| !value.trim().is_empty())
        };
        let path = |name: &str| var(name).map(PathBuf::from);
        let number = |name: &str| var(name).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            config_path: path("USEQ_CONFIG_PATH"),
            run_roots: var("USEQ_RUN_ROOTS")
                .map(|raw| parse_csv(&raw).into_iter().map(PathBuf::from).collect()),
            completion_marker: var("USEQ_COMPLETION_MARKER"),
            staging_dir: path("USEQ_STAGING_DIR"),
            destination_dir: path("USEQ_DESTINATION_DIR"),
            archive_dir: path("USEQ_ARCHIVE_DIR"),
            state_dir: path("USEQ_STATE_DIR"),
            database_url: var("USEQ_DATABASE_URL").or_else(|| var("DATABASE_URL")),
            conversion_program: var("USEQ_CONVERSION_PROGRAM"),
            cycle_interval_ms: number("USEQ_CYCLE_INTERVAL_MS"),
            max_parallel_stages: var("USEQ_MAX_PARALLEL_STAGES")
                .and_then(|s| s.trim().parse().ok()),
            nextcloud_url: var("USEQ_NEXTCLOUD_URL"),
            nextcloud_user: var("USEQ_NEXTCLOUD_USER"),
            nextcloud_password: var("USEQ_NEXTCLOUD_PASSWORD"),
            nextcloud_password_file: path("USEQ_NEXTCLOUD_PASSWORD_FILE"),
            storage_threshold_bytes: number("USEQ_STORAGE_THRESHOLD_BYTES"),
            notify_sender: var("USEQ_NOTIFY_SENDER"),
            notify_recipients: var("USEQ_NOTIFY_RECIPIENTS").map(|raw| parse_csv(&raw)),
        }
    }
}

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}
