use std::path::{Path, PathBuf};

use thiserror::Error;
use useq_core::pipeline::stages::conversion::MAX_BARCODE_MISMATCHES;

use super::models::{DaemonConfig, StateConfig};

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("no run roots configured; set layout.run_roots or USEQ_RUN_ROOTS")]
    EmptyRunRoots,
    #[error("orchestrator.cycle.max_parallel_stages must be at least 1")]
    ZeroWorkers,
    #[error("orchestrator.retry.max_attempts must be at least 1")]
    ZeroRetries,
    #[error("{name} {dir} lies inside run root {root}")]
    NestedDirectory {
        name: &'static str,
        dir: PathBuf,
        root: PathBuf,
    },
    #[error(
        "default barcode mismatches {value} exceeds the supported maximum of {max}"
    )]
    InvalidDefaultFlags { value: u8, max: u8 },
    #[error("invalid Nextcloud URL '{url}'")]
    InvalidStorageUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("completion marker must be a plain file name, got '{0}'")]
    InvalidCompletionMarker(String),
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(
    config: &DaemonConfig,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let layout = &config.layout;

    if layout.run_roots.is_empty() {
        return Err(ConfigGuardRailError::EmptyRunRoots);
    }
    if config.orchestrator.cycle.max_parallel_stages == 0 {
        return Err(ConfigGuardRailError::ZeroWorkers);
    }
    if config.orchestrator.retry.max_attempts == 0 {
        return Err(ConfigGuardRailError::ZeroRetries);
    }

    let marker = Path::new(&layout.completion_marker);
    if layout.completion_marker.is_empty() || marker.components().count() != 1 {
        return Err(ConfigGuardRailError::InvalidCompletionMarker(
            layout.completion_marker.clone(),
        ));
    }

    let mut owned = vec![
        ("layout.staging_dir", layout.staging_dir.as_path()),
        ("layout.destination_dir", layout.destination_dir.as_path()),
        ("layout.archive_dir", layout.archive_dir.as_path()),
    ];
    if let StateConfig::File { dir } = &config.state {
        owned.push(("state.dir", dir.as_path()));
    }
    // A directory under a run root would be scanned as a run.
    for root in &layout.run_roots {
        for &(name, dir) in &owned {
            if dir.starts_with(root) {
                return Err(ConfigGuardRailError::NestedDirectory {
                    name,
                    dir: dir.to_path_buf(),
                    root: root.clone(),
                });
            }
        }
    }

    let flags = config.conversion.default_flags;
    if flags.barcode_mismatches > MAX_BARCODE_MISMATCHES {
        return Err(ConfigGuardRailError::InvalidDefaultFlags {
            value: flags.barcode_mismatches,
            max: MAX_BARCODE_MISMATCHES,
        });
    }

    match &config.storage.nextcloud {
        Some(nextcloud) => {
            url::Url::parse(&nextcloud.base_url).map_err(|source| {
                ConfigGuardRailError::InvalidStorageUrl {
                    url: nextcloud.base_url.clone(),
                    source,
                }
            })?;
            if nextcloud.password.is_empty() {
                warnings.push_with_hint(
                    "Nextcloud password is empty; capacity polls will likely be rejected",
                    "Set storage.password_file or USEQ_NEXTCLOUD_PASSWORD",
                );
            }
        }
        None => warnings.push_with_hint(
            "Remote storage not configured; transfers will not be gated on free space",
            "Set storage.base_url and storage.user, or USEQ_NEXTCLOUD_URL and USEQ_NEXTCLOUD_USER",
        ),
    }

    if config.storage.monitor.clear_margin_bytes == 0 {
        warnings.push(
            "storage.clear_margin_bytes is 0; alerts may flap around the threshold",
        );
    }

    if config.notifications.recipients.is_empty() {
        warnings.push_with_hint(
            "No notification recipients configured; failures are only logged",
            "Set notifications.recipients or USEQ_NOTIFY_RECIPIENTS",
        );
    }

    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigMetadata, NextcloudConfig, StorageConfig};
    use std::time::Duration;
    use useq_core::{
        notify::NotificationConfig,
        pipeline::{ConversionConfig, LayoutConfig, OrchestratorConfig},
    };

    fn config() -> DaemonConfig {
        DaemonConfig {
            layout: LayoutConfig {
                run_roots: vec![PathBuf::from("/data/runs")],
                completion_marker: LayoutConfig::DEFAULT_COMPLETION_MARKER.into(),
                staging_dir: PathBuf::from("/data/staging"),
                destination_dir: PathBuf::from("/data/dest"),
                archive_dir: PathBuf::from("/archive"),
            },
            state: StateConfig::File {
                dir: PathBuf::from("/var/lib/useq"),
            },
            orchestrator: OrchestratorConfig::default(),
            conversion: ConversionConfig::default(),
            storage: StorageConfig {
                nextcloud: Some(NextcloudConfig {
                    base_url: "https://cloud.example.org".into(),
                    user: "useq".into(),
                    password: "secret".into(),
                    timeout: Duration::from_secs(30),
                }),
                ..StorageConfig::default()
            },
            notifications: NotificationConfig {
                sender: None,
                recipients: vec!["ops@example.org".into()],
            },
            metadata: ConfigMetadata::default(),
        }
    }

    #[test]
    fn complete_config_passes_without_warnings() {
        let warnings = apply_guard_rails(&config()).unwrap();
        assert!(warnings.is_empty(), "{:?}", warnings.items);
    }

    #[test]
    fn rejects_directories_inside_run_roots() {
        let mut config = config();
        config.layout.staging_dir = PathBuf::from("/data/runs/staging");
        let err = apply_guard_rails(&config).unwrap_err();
        assert!(matches!(
            err,
            ConfigGuardRailError::NestedDirectory {
                name: "layout.staging_dir",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_workers_and_retries() {
        let mut config = config();
        config.orchestrator.cycle.max_parallel_stages = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::ZeroWorkers)
        ));

        let mut config = self::config();
        config.orchestrator.retry.max_attempts = 0;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::ZeroRetries)
        ));
    }

    #[test]
    fn rejects_marker_paths_and_excess_mismatches() {
        let mut config = config();
        config.layout.completion_marker = "../RTAComplete.txt".into();
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidCompletionMarker(_))
        ));

        let mut config = self::config();
        config.conversion.default_flags.barcode_mismatches = 3;
        assert!(matches!(
            apply_guard_rails(&config),
            Err(ConfigGuardRailError::InvalidDefaultFlags { value: 3, max: 2 })
        ));
    }

    #[test]
    fn missing_storage_and_recipients_are_warnings() {
        let mut config = config();
        config.storage.nextcloud = None;
        config.notifications.recipients.clear();
        let warnings = apply_guard_rails(&config).unwrap();
        assert_eq!(warnings.items.len(), 2);
    }
}
