use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use useq_config::{DaemonConfig, NextcloudConfig, StateConfig};
use useq_core::{
    notify::{Notifier, TracingNotifier},
    pipeline::{
        ArchiveStage, CleanupStage, ConversionFlags, ConversionStage,
        DefaultStageDispatcher, InProcPipelineEventBus, JsonFileRunStore,
        PipelineRuntime, PipelineRuntimeBuilder, RunScanner, RunStateStore,
        StageHandlers, TransferStage,
    },
    storage::{NextcloudCapacityProbe, StorageHandle, StorageMonitor},
};

pub type DaemonRuntime = PipelineRuntime<dyn RunStateStore, InProcPipelineEventBus>;

/// Open the configured run state backend.
pub async fn open_store(config: &DaemonConfig) -> anyhow::Result<Arc<dyn RunStateStore>> {
    match &config.state {
        StateConfig::File { dir } => {
            let store = JsonFileRunStore::open(dir.clone())
                .await
                .with_context(|| {
                    format!("failed to open run state directory {}", dir.display())
                })?;
            info!(dir = %dir.display(), "using file run state store");
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        StateConfig::Postgres { url } => {
            let store = useq_core::pipeline::PostgresRunStateStore::connect(url)
                .await
                .context("failed to connect run state store to PostgreSQL")?;
            info!("using PostgreSQL run state store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StateConfig::Postgres { .. } => anyhow::bail!(
            "state backend 'postgres' requires useq to be built with the `postgres` feature"
        ),
    }
}

pub fn notifier(config: &DaemonConfig) -> Arc<dyn Notifier> {
    Arc::new(TracingNotifier::new(config.notifications.sender.clone()))
}

fn probe(nextcloud: &NextcloudConfig) -> anyhow::Result<NextcloudCapacityProbe> {
    NextcloudCapacityProbe::new(
        &nextcloud.base_url,
        nextcloud.user.clone(),
        nextcloud.password.clone(),
        nextcloud.timeout,
    )
    .context("failed to create Nextcloud capacity probe")
}

/// Storage monitor for the configured endpoint, or `None` when no endpoint
/// is configured.
pub fn storage_monitor(
    config: &DaemonConfig,
    notifier: Arc<dyn Notifier>,
) -> anyhow::Result<Option<Arc<StorageMonitor>>> {
    let Some(nextcloud) = &config.storage.nextcloud else {
        return Ok(None);
    };
    let monitor = StorageMonitor::new(
        Arc::new(probe(nextcloud)?),
        notifier,
        config.notifications.recipients.clone(),
        config.storage.monitor,
    );
    Ok(Some(Arc::new(monitor)))
}

pub fn stage_handlers(
    config: &DaemonConfig,
    storage: StorageHandle,
) -> anyhow::Result<StageHandlers> {
    StageHandlers::new(
        Arc::new(ConversionStage::new(
            config.conversion.clone(),
            config.layout.clone(),
        )),
        Arc::new(TransferStage::new(config.layout.clone(), storage)),
        Arc::new(CleanupStage::new(config.layout.clone())),
        Arc::new(ArchiveStage::new(config.layout.clone())),
    )
    .context("failed to register stage handlers")
}

/// Assemble the orchestrator from configuration and opened collaborators.
pub fn runtime(
    config: &DaemonConfig,
    store: Arc<dyn RunStateStore>,
    events: Arc<InProcPipelineEventBus>,
    storage: StorageHandle,
    notifier: Arc<dyn Notifier>,
    flags: ConversionFlags,
) -> anyhow::Result<DaemonRuntime> {
    let dispatcher = DefaultStageDispatcher::new(
        stage_handlers(config, storage.clone())?,
        config.orchestrator.timeouts,
    );
    let scanner = RunScanner::new(
        config.layout.run_roots.clone(),
        config.layout.completion_marker.clone(),
        flags,
        Arc::clone(&store),
    )
    .with_events(events.clone());

    PipelineRuntimeBuilder::new(config.orchestrator.clone())
        .with_store(store)
        .with_events(events)
        .with_dispatcher(Arc::new(dispatcher))
        .with_storage(storage)
        .with_notifier(notifier, config.notifications.recipients.clone())
        .with_scanner(scanner)
        .build()
        .context("failed to build pipeline runtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use useq_config::{ConfigMetadata, StorageConfig};
    use useq_core::{
        notify::NotificationConfig,
        pipeline::{ConversionConfig, LayoutConfig, OrchestratorConfig},
    };

    fn config(root: &Path) -> DaemonConfig {
        DaemonConfig {
            layout: LayoutConfig {
                run_roots: vec![root.join("runs")],
                completion_marker: LayoutConfig::DEFAULT_COMPLETION_MARKER.into(),
                staging_dir: root.join("staging"),
                destination_dir: root.join("destination"),
                archive_dir: root.join("archive"),
            },
            state: StateConfig::File {
                dir: root.join("state"),
            },
            orchestrator: OrchestratorConfig::default(),
            conversion: ConversionConfig::default(),
            storage: StorageConfig::default(),
            notifications: NotificationConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }

    #[tokio::test]
    async fn builds_runtime_without_storage_endpoint() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = config(tmp.path());
        config.ensure_directories().unwrap();

        let notifier = notifier(&config);
        assert!(storage_monitor(&config, notifier.clone()).unwrap().is_none());

        let store = open_store(&config).await.unwrap();
        let runtime = runtime(
            &config,
            store,
            Arc::new(InProcPipelineEventBus::default()),
            StorageHandle::unmonitored(),
            notifier,
            ConversionFlags::default(),
        )
        .unwrap();

        let report = runtime.run_cycle().await.unwrap();
        assert_eq!(report.dispatched, 0);
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn postgres_backend_needs_feature() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = config(tmp.path());
        config.state = StateConfig::Postgres {
            url: "postgres://localhost/useq".into(),
        };
        let err = open_store(&config).await.err().unwrap();
        assert!(err.to_string().contains("postgres"));
    }
}
