use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::Context;
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use useq_config::DaemonConfig;
use useq_core::{
    RunId,
    pipeline::{self, ConversionFlags, InProcPipelineEventBus, RunStatus},
    storage::{StorageHandle, StorageMonitor},
};

use crate::wiring;

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!(error = %err, "failed to listen for shutdown signal"),
    }
}

/// Poll once so the first cycle sees a real snapshot, then keep polling in
/// the background until `cancel` fires.
async fn spawn_monitor(
    monitor: Arc<StorageMonitor>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    if let Err(err) = monitor.poll_once().await {
        warn!(
            target: "storage::monitor",
            error = %err,
            "initial storage poll failed; transfers proceed until a poll succeeds"
        );
    }
    tokio::spawn(async move { monitor.run(cancel).await })
}

pub async fn manage_runs(
    config: DaemonConfig,
    flags: ConversionFlags,
) -> anyhow::Result<()> {
    config
        .ensure_directories()
        .context("failed to create pipeline directories")?;

    let store = wiring::open_store(&config).await?;
    let notifier = wiring::notifier(&config);
    let cancel = CancellationToken::new();

    let (storage, monitor_task) =
        match wiring::storage_monitor(&config, notifier.clone())? {
            Some(monitor) => {
                let handle = monitor.handle();
                let task = spawn_monitor(monitor, cancel.child_token()).await;
                (handle, Some(task))
            }
            None => {
                info!(
                    target: "storage::monitor",
                    "no storage endpoint configured; transfers are not gated"
                );
                (StorageHandle::unmonitored(), None)
            }
        };

    let events = Arc::new(InProcPipelineEventBus::default());
    let runtime =
        wiring::runtime(&config, store, events, storage, notifier, flags)?;
    runtime
        .start()
        .await
        .context("failed to start pipeline runtime")?;
    info!(
        run_roots = ?config.layout.run_roots,
        flags = ?flags,
        "managing runs"
    );

    wait_for_shutdown().await;

    let result = runtime
        .shutdown()
        .await
        .context("pipeline shutdown failed");
    cancel.cancel();
    if let Some(task) = monitor_task
        && let Err(err) = task.await
    {
        warn!(target: "storage::monitor", error = %err, "storage monitor task failed");
    }
    result
}

pub async fn check_storage(config: DaemonConfig) -> anyhow::Result<()> {
    let notifier = wiring::notifier(&config);
    let Some(monitor) = wiring::storage_monitor(&config, notifier)? else {
        anyhow::bail!(
            "no storage endpoint configured; set storage.base_url or USEQ_NEXTCLOUD_URL"
        );
    };

    let cancel = CancellationToken::new();
    let task = spawn_monitor(monitor, cancel.clone()).await;
    wait_for_shutdown().await;
    cancel.cancel();
    task.await.context("storage monitor task failed")?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, value).context("failed to encode output")?;
    writeln!(out)?;
    Ok(())
}

pub async fn list_runs(
    config: &DaemonConfig,
    status: Option<RunStatus>,
) -> anyhow::Result<()> {
    let store = wiring::open_store(config).await?;
    let records = match status {
        Some(status) => store.list_by_status(status).await?,
        None => store.load().await?,
    };
    for record in &records {
        print_json(record)?;
    }
    Ok(())
}

pub async fn run_status(config: &DaemonConfig, run_id: &str) -> anyhow::Result<()> {
    let run_id = RunId::new(run_id)?;
    let store = wiring::open_store(config).await?;
    let record = store
        .get(&run_id)
        .await?
        .with_context(|| format!("run {run_id} is not tracked"))?;
    print_json(&record)
}

/// A running daemon picks the re-armed record up on its next cycle.
pub async fn rearm_run(config: &DaemonConfig, run_id: &str) -> anyhow::Result<()> {
    let run_id = RunId::new(run_id)?;
    let store = wiring::open_store(config).await?;
    let record = pipeline::rearm_run(store.as_ref(), &run_id)
        .await
        .with_context(|| format!("failed to re-arm run {run_id}"))?;
    info!(run_id = %run_id, to = %record.status, "run re-armed");
    print_json(&record)
}
