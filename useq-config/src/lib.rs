//! Configuration for the USEQ daemon.
//!
//! A TOML file supplies the deployment layout; `USEQ_*` environment
//! variables (optionally from a `.env` file) override individual values.
//! The loader composes both into a [`DaemonConfig`] and runs guard rails
//! before the daemon wires anything up.

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    ConfigMetadata, DaemonConfig, NextcloudConfig, StateConfig, StorageConfig,
};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
