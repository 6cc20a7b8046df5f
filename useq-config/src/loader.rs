use once_cell::sync::Lazy;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use useq_core::{
    notify::NotificationConfig,
    pipeline::{ConversionConfig, LayoutConfig, StorageMonitorConfig},
};

use super::{
    models::{
        ConfigMetadata, DaemonConfig, NextcloudConfig, StateConfig,
        StorageConfig,
    },
    sources::{EnvConfig, FileConfig, FileStorageConfig, StateBackend},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![PathBuf::from("useq.toml"), PathBuf::from("config/useq.toml")]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, read the process environment and compose the config.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Compose from an already gathered environment. Leaves the process
    /// environment untouched.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(path) = &self.options.config_path {
            (Some(path.clone()), true)
        } else if let Some(path) = &env.config_path {
            (Some(path.clone()), true)
        } else {
            (
                DEFAULT_CONFIG_LOCATIONS
                    .iter()
                    .find(|candidate| candidate.exists())
                    .cloned(),
                false,
            )
        };

        let Some(path) = path else {
            return Ok((None, None));
        };
        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| {
                ConfigLoadError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;
        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
    ) -> Result<(DaemonConfig, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        if file_config.is_none() {
            warnings.push_with_hint(
                "No useq.toml detected; falling back to environment variables",
                "Create useq.toml or point USEQ_CONFIG_PATH at one",
            );
        }

        let FileConfig {
            layout: file_layout,
            state: file_state,
            orchestrator: file_orchestrator,
            conversion: file_conversion,
            storage: file_storage,
            notifications: file_notifications,
        } = file_config.unwrap_or_default();

        let layout = LayoutConfig {
            run_roots: env
                .run_roots
                .clone()
                .or(file_layout.run_roots)
                .unwrap_or_default(),
            completion_marker: env
                .completion_marker
                .clone()
                .or(file_layout.completion_marker)
                .unwrap_or_else(|| {
                    LayoutConfig::DEFAULT_COMPLETION_MARKER.to_string()
                }),
            staging_dir: required(
                env.staging_dir.clone().or(file_layout.staging_dir),
                "layout.staging_dir",
            )?,
            destination_dir: required(
                env.destination_dir.clone().or(file_layout.destination_dir),
                "layout.destination_dir",
            )?,
            archive_dir: required(
                env.archive_dir.clone().or(file_layout.archive_dir),
                "layout.archive_dir",
            )?,
        };

        let backend = match (file_state.backend, env.database_url.is_some()) {
            (Some(backend), _) => backend,
            (None, true) => StateBackend::Postgres,
            (None, false) => StateBackend::File,
        };
        let state = match backend {
            StateBackend::File => StateConfig::File {
                dir: env
                    .state_dir
                    .clone()
                    .or(file_state.dir)
                    .unwrap_or_else(|| PathBuf::from(StateConfig::DEFAULT_DIR)),
            },
            StateBackend::Postgres => StateConfig::Postgres {
                url: required(
                    env.database_url.clone().or(file_state.url),
                    "state.url",
                )?,
            },
        };

        let mut orchestrator = file_orchestrator.unwrap_or_default();
        if let Some(interval_ms) = env.cycle_interval_ms {
            orchestrator.cycle.interval_ms = interval_ms;
        }
        if let Some(workers) = env.max_parallel_stages {
            orchestrator.cycle.max_parallel_stages = workers;
        }

        let conversion_defaults = ConversionConfig::default();
        let conversion = ConversionConfig {
            program: env
                .conversion_program
                .clone()
                .or(file_conversion.program)
                .unwrap_or(conversion_defaults.program),
            extra_args: file_conversion
                .extra_args
                .unwrap_or(conversion_defaults.extra_args),
            default_flags: file_conversion
                .default_flags
                .unwrap_or(conversion_defaults.default_flags),
        };

        let storage = Self::compose_storage(&env, file_storage)?;

        let notifications = NotificationConfig {
            sender: env.notify_sender.clone().or(file_notifications.sender),
            recipients: env
                .notify_recipients
                .clone()
                .or(file_notifications.recipients)
                .unwrap_or_default(),
        };

        let config = DaemonConfig {
            layout,
            state,
            orchestrator,
            conversion,
            storage,
            notifications,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded: false,
            },
        };

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }

    fn compose_storage(
        env: &EnvConfig,
        file: FileStorageConfig,
    ) -> Result<StorageConfig, ConfigLoadError> {
        let defaults = StorageMonitorConfig::default();
        let monitor = StorageMonitorConfig {
            threshold_bytes: env
                .storage_threshold_bytes
                .or(file.threshold_bytes)
                .unwrap_or(defaults.threshold_bytes),
            clear_margin_bytes: file
                .clear_margin_bytes
                .unwrap_or(defaults.clear_margin_bytes),
            poll_interval_ms: file
                .poll_interval_ms
                .unwrap_or(defaults.poll_interval_ms),
        };

        let base_url = env.nextcloud_url.clone().or(file.base_url);
        let user = env.nextcloud_user.clone().or(file.user);
        let nextcloud = match (base_url, user) {
            (Some(base_url), Some(user)) => {
                let password = Self::resolve_password(
                    env,
                    file.password,
                    file.password_file,
                )?;
                Some(NextcloudConfig {
                    base_url,
                    user,
                    password: password.unwrap_or_default(),
                    timeout: Duration::from_secs(
                        file.timeout_secs
                            .unwrap_or(NextcloudConfig::DEFAULT_TIMEOUT_SECS),
                    ),
                })
            }
            (Some(_), None) => {
                return Err(ConfigLoadError::MissingSetting {
                    key: "storage.user",
                });
            }
            (None, Some(_)) => {
                return Err(ConfigLoadError::MissingSetting {
                    key: "storage.base_url",
                });
            }
            (None, None) => None,
        };

        Ok(StorageConfig { nextcloud, monitor })
    }

    /// Environment password, then password files, then the inline value.
    fn resolve_password(
        env: &EnvConfig,
        inline: Option<String>,
        file_path: Option<PathBuf>,
    ) -> Result<Option<String>, ConfigLoadError> {
        if let Some(password) = env.nextcloud_password.clone() {
            return Ok(Some(password));
        }
        for path in [env.nextcloud_password_file.as_ref(), file_path.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(secret) = Self::read_secret_file(path)? {
                return Ok(Some(secret));
            }
        }
        Ok(inline.filter(|value| !value.trim().is_empty()))
    }

    fn read_secret_file(
        path: &Path,
    ) -> Result<Option<String>, ConfigLoadError> {
        let contents = fs::read_to_string(path).map_err(|source| {
            ConfigLoadError::SecretFileIo {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }
}

fn required<T>(value: Option<T>, key: &'static str) -> Result<T, ConfigLoadError> {
    value.ok_or(ConfigLoadError::MissingSetting { key })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("required setting {key} is not configured")]
    MissingSetting { key: &'static str },
    #[error("failed to read secret file {path}")]
    SecretFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: DaemonConfig,
    pub warnings: ConfigWarnings,
}
