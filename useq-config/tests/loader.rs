use std::{path::Path, time::Duration};

use tempfile::TempDir;
use useq_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig, StateConfig,
};

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("useq.toml");
    std::fs::write(&path, body).expect("write config");
    path
}

const FULL: &str = r#"
[layout]
run_roots = ["/data/novaseq", "/data/nextseq"]
staging_dir = "/data/staging"
destination_dir = "/data/dest"
archive_dir = "/archive"

[state]
backend = "file"
dir = "/var/lib/useq"

[orchestrator.cycle]
interval_ms = 30000
max_parallel_stages = 3

[orchestrator.retry]
max_attempts = 5

[conversion]
program = "/opt/bcl2fastq/bin/bcl2fastq"
extra_args = ["--no-lane-splitting"]

[conversion.default_flags]
barcode_mismatches = 0
emit_index_fastq = true

[storage]
base_url = "https://cloud.example.org"
user = "useq"
password = "inline-secret"
threshold_bytes = 5000
clear_margin_bytes = 1000

[notifications]
sender = "useq@example.org"
recipients = ["ops@example.org"]
"#;

#[test]
fn file_values_compose_into_daemon_config() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_config(tmp.path(), FULL);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .expect("config loads");
    let config = load.config;

    assert!(load.warnings.is_empty(), "{:?}", load.warnings.items);
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.layout.run_roots.len(), 2);
    assert_eq!(config.layout.completion_marker, "RTAComplete.txt");
    assert_eq!(
        config.state,
        StateConfig::File {
            dir: "/var/lib/useq".into()
        }
    );
    assert_eq!(config.orchestrator.cycle.interval_ms, 30_000);
    assert_eq!(config.orchestrator.cycle.max_parallel_stages, 3);
    assert_eq!(config.orchestrator.retry.max_attempts, 5);
    assert_eq!(config.orchestrator.retry.backoff_base_ms, 60_000);
    assert_eq!(config.conversion.extra_args, vec!["--no-lane-splitting"]);
    assert_eq!(config.conversion.default_flags.barcode_mismatches, 0);
    assert!(config.conversion.default_flags.emit_index_fastq);

    let nextcloud = config.storage.nextcloud.expect("nextcloud configured");
    assert_eq!(nextcloud.password, "inline-secret");
    assert_eq!(nextcloud.timeout, Duration::from_secs(30));
    assert_eq!(config.storage.monitor.threshold_bytes, 5_000);
    assert_eq!(config.notifications.recipients, vec!["ops@example.org"]);
}

#[test]
fn environment_overrides_file_values() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_config(tmp.path(), FULL);
    let secret = tmp.path().join("nextcloud.pass");
    std::fs::write(&secret, "from-file\n").expect("write secret");

    let env = EnvConfig {
        run_roots: Some(vec!["/mnt/runs".into()]),
        max_parallel_stages: Some(8),
        nextcloud_password_file: Some(secret),
        database_url: Some("postgres://useq@db/useq".into()),
        ..EnvConfig::default()
    };
    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env)
        .expect("config loads")
        .config;

    assert_eq!(config.layout.run_roots, vec![Path::new("/mnt/runs")]);
    assert_eq!(config.orchestrator.cycle.max_parallel_stages, 8);
    assert_eq!(
        config.storage.nextcloud.map(|n| n.password).as_deref(),
        Some("from-file")
    );
    // An explicit file backend wins over a stray DATABASE_URL.
    assert!(matches!(config.state, StateConfig::File { .. }));
}

#[test]
fn environment_alone_is_enough() {
    let env = EnvConfig {
        config_path: None,
        run_roots: Some(vec!["/data/runs".into()]),
        staging_dir: Some("/data/staging".into()),
        destination_dir: Some("/data/dest".into()),
        archive_dir: Some("/archive".into()),
        database_url: Some("postgres://useq@db/useq".into()),
        ..EnvConfig::default()
    };
    let tmp = TempDir::new().expect("tempdir");
    let load = ConfigLoader::new()
        .with_config_path(write_config(tmp.path(), ""))
        .load_with_env(env)
        .expect("config loads");

    assert!(matches!(load.config.state, StateConfig::Postgres { .. }));
    assert!(load.config.storage.nextcloud.is_none());
    // No remote storage and no recipients.
    assert_eq!(load.warnings.items.len(), 2);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    let err = ConfigLoader::new()
        .with_config_path(tmp.path().join("absent.toml"))
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn missing_layout_and_bad_toml_are_reported() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_config(tmp.path(), "[layout]\nrun_roots = [\"/data/runs\"]\n");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::MissingSetting {
            key: "layout.staging_dir"
        }
    ));

    let path = write_config(tmp.path(), "[layout\n");
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));
}

#[test]
fn guard_rails_surface_through_the_loader() {
    let tmp = TempDir::new().expect("tempdir");
    let path = write_config(
        tmp.path(),
        r#"
[layout]
run_roots = ["/data/runs"]
staging_dir = "/data/runs/.staging"
destination_dir = "/data/dest"
archive_dir = "/archive"
"#,
    );
    let err = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default())
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::NestedDirectory { .. })
    ));
}
