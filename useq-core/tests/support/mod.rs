//! Shared fixtures and collaborator doubles for core integration tests.
#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;
use useq_core::{
    Result, RunId,
    notify::{Notification, Notifier},
    pipeline::{
        ArchiveStage, CleanupStage, ConversionConfig, ConversionFlags,
        ConversionStage, DefaultStageDispatcher, InProcPipelineEventBus,
        JsonFileRunStore, LayoutConfig, OrchestratorConfig, PipelineEvent,
        PipelineRuntime, PipelineRuntimeBuilder, RunScanner, StageDispatcher,
        StageHandlers, StorageMonitorConfig, TransferStage,
    },
    storage::{CapacityProbe, CapacityReading, StorageMonitor},
};

pub type TestRuntime = PipelineRuntime<JsonFileRunStore, InProcPipelineEventBus>;

pub const TOTAL_BYTES: u64 = 100_000;
pub const THRESHOLD_BYTES: u64 = 10_000;
pub const CLEAR_MARGIN_BYTES: u64 = 5_000;

/// Emulates the conversion tool. Fails on a missing intermediate BCL unless
/// told to tolerate it, otherwise writes one FASTQ file.
pub const CONVERTER_SCRIPT: &str = r#"
run=""; out=""; ignore=0
while [ $# -gt 0 ]; do
  case "$1" in
    --runfolder-dir) run="$2"; shift 2 ;;
    --output-dir) out="$2"; shift 2 ;;
    --ignore-missing-bcls) ignore=1; shift ;;
    *) shift ;;
  esac
done
if [ ! -f "$run/Data/Intensities/BaseCalls/L001/s_1_1101.bcl" ] && [ "$ignore" -eq 0 ]; then
  echo "ERROR: missing bcl s_1_1101.bcl" >&2
  exit 1
fi
mkdir -p "$out/Project_A"
printf '@r1\nACGT\n+\nIIII\n' > "$out/Project_A/S1_L001_R1_001.fastq.gz"
"#;

/// Capacity probe whose free space the test sets directly.
#[derive(Debug)]
pub struct FreeSpaceProbe {
    free: AtomicU64,
}

impl FreeSpaceProbe {
    pub fn new(free: u64) -> Self {
        Self {
            free: AtomicU64::new(free),
        }
    }

    pub fn set_free(&self, free: u64) {
        self.free.store(free, Ordering::SeqCst);
    }
}

#[async_trait]
impl CapacityProbe for FreeSpaceProbe {
    async fn read_capacity(&self) -> Result<CapacityReading> {
        let free = self.free.load(Ordering::SeqCst).min(TOTAL_BYTES);
        Ok(CapacityReading {
            used_bytes: TOTAL_BYTES - free,
            total_bytes: TOTAL_BYTES,
        })
    }
}

/// Keeps every notification for later assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().expect("notifier lock").clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent().into_iter().map(|n| n.subject).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        self.sent.lock().expect("notifier lock").push(notification);
        Ok(())
    }
}

pub struct Harness {
    pub root: TempDir,
    pub layout: LayoutConfig,
    pub script: PathBuf,
    pub store: Arc<JsonFileRunStore>,
    pub events: Arc<InProcPipelineEventBus>,
    pub probe: Arc<FreeSpaceProbe>,
    pub notifier: Arc<RecordingNotifier>,
    pub monitor: StorageMonitor,
}

impl Harness {
    pub async fn new() -> Self {
        let root = TempDir::new().expect("tempdir");
        let layout = LayoutConfig {
            run_roots: vec![root.path().join("runs")],
            completion_marker: LayoutConfig::DEFAULT_COMPLETION_MARKER.into(),
            staging_dir: root.path().join("staging"),
            destination_dir: root.path().join("dest"),
            archive_dir: root.path().join("archive"),
        };
        std::fs::create_dir_all(&layout.run_roots[0]).expect("runs dir");
        let script = root.path().join("convert.sh");
        std::fs::write(&script, CONVERTER_SCRIPT).expect("write script");

        let store = Arc::new(
            JsonFileRunStore::open(root.path().join("state"))
                .await
                .expect("open store"),
        );
        let probe = Arc::new(FreeSpaceProbe::new(TOTAL_BYTES / 2));
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = StorageMonitor::new(
            probe.clone(),
            notifier.clone(),
            vec!["ops@example.org".into()],
            StorageMonitorConfig {
                threshold_bytes: THRESHOLD_BYTES,
                clear_margin_bytes: CLEAR_MARGIN_BYTES,
                poll_interval_ms: 10,
            },
        );
        monitor.poll_once().await.expect("initial poll");

        Self {
            root,
            layout,
            script,
            store,
            events: Arc::new(InProcPipelineEventBus::new(256)),
            probe,
            notifier,
            monitor,
        }
    }

    /// Simulates a daemon restart: a fresh store reading the same directory.
    pub async fn reopen_store(&mut self) {
        self.store = Arc::new(
            JsonFileRunStore::open(self.root.path().join("state"))
                .await
                .expect("reopen store"),
        );
    }

    pub fn run_root(&self) -> &Path {
        &self.layout.run_roots[0]
    }

    /// Creates a complete run directory. `with_bcl = false` leaves out one
    /// intermediate base-call file.
    pub fn make_run(&self, name: &str, with_bcl: bool) -> PathBuf {
        let dir = self.run_root().join(name);
        let lane = dir.join("Data/Intensities/BaseCalls/L001");
        std::fs::create_dir_all(&lane).expect("run dir");
        std::fs::write(dir.join("RunInfo.xml"), b"<RunInfo/>").expect("run info");
        if with_bcl {
            std::fs::write(lane.join("s_1_1101.bcl"), b"bcl").expect("bcl");
        }
        std::fs::write(dir.join(&self.layout.completion_marker), b"")
            .expect("marker");
        dir
    }

    pub fn conversion_config(&self) -> ConversionConfig {
        ConversionConfig {
            program: "sh".into(),
            extra_args: vec![self.script.display().to_string()],
            default_flags: ConversionFlags::default(),
        }
    }

    pub fn handlers(&self) -> StageHandlers {
        StageHandlers::new(
            Arc::new(ConversionStage::new(
                self.conversion_config(),
                self.layout.clone(),
            )),
            Arc::new(TransferStage::new(
                self.layout.clone(),
                self.monitor.handle(),
            )),
            Arc::new(CleanupStage::new(self.layout.clone())),
            Arc::new(ArchiveStage::new(self.layout.clone())),
        )
        .expect("handlers match their stages")
    }

    pub fn scanner(&self, flags: ConversionFlags) -> RunScanner<JsonFileRunStore> {
        RunScanner::new(
            self.layout.run_roots.clone(),
            self.layout.completion_marker.clone(),
            flags,
            self.store.clone(),
        )
        .with_events(self.events.clone())
    }

    /// Runtime over the real stage handlers.
    pub fn runtime(&self, config: OrchestratorConfig) -> TestRuntime {
        let dispatcher =
            DefaultStageDispatcher::new(self.handlers(), config.timeouts);
        self.runtime_with(config, Arc::new(dispatcher))
    }

    pub fn runtime_with(
        &self,
        config: OrchestratorConfig,
        dispatcher: Arc<dyn StageDispatcher>,
    ) -> TestRuntime {
        PipelineRuntimeBuilder::new(config)
            .with_store(self.store.clone())
            .with_events(self.events.clone())
            .with_dispatcher(dispatcher)
            .with_storage(self.monitor.handle())
            .with_notifier(self.notifier.clone(), vec!["ops@example.org".into()])
            .with_scanner(self.scanner(ConversionFlags::default()))
            .build()
            .expect("runtime builds")
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Moves free space below the threshold and publishes it.
    pub async fn breach_storage(&self) {
        self.probe.set_free(THRESHOLD_BYTES / 2);
        self.monitor.poll_once().await.expect("poll");
    }

    /// Moves free space above threshold plus margin and publishes it.
    pub async fn clear_storage(&self) {
        self.probe.set_free(THRESHOLD_BYTES + CLEAR_MARGIN_BYTES + 1);
        self.monitor.poll_once().await.expect("poll");
    }
}

/// Retries immediately so tests do not wait out real backoff.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry.backoff_base_ms = 0;
    config.cycle.max_parallel_stages = 4;
    config.cycle.shutdown_grace_ms = 5_000;
    config
}

pub fn run_id(name: &str) -> RunId {
    RunId::new(name).expect("valid run id")
}

/// Drains the events published so far.
pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
