use std::{
    any::type_name,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use super::{
    events::{PipelineEvent, PipelineEventPayload, PipelineEventPublisher},
    run::{ConversionFlags, RunRecord},
    state_store::RunStateStore,
};
use crate::error::Result;
use crate::lims::{LimsClient, MetadataField};
use crate::types::ids::RunId;

/// Totals from one pass over the run roots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub registered: Vec<RunId>,
    pub already_tracked: usize,
    /// Run directories still missing the completion marker.
    pub incomplete: usize,
}

/// Registers completed run directories as `Discovered` records.
///
/// Only the completion marker is inspected; validating run contents is left
/// to the conversion stage.
pub struct RunScanner<S>
where
    S: RunStateStore + ?Sized + 'static,
{
    roots: Vec<PathBuf>,
    marker: String,
    default_flags: ConversionFlags,
    store: Arc<S>,
    lims: Option<Arc<dyn LimsClient>>,
    events: Option<Arc<dyn PipelineEventPublisher>>,
}

impl<S> fmt::Debug for RunScanner<S>
where
    S: RunStateStore + ?Sized + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunScanner")
            .field("roots", &self.roots)
            .field("marker", &self.marker)
            .field("default_flags", &self.default_flags)
            .field("store_type", &type_name::<S>())
            .field("lims_set", &self.lims.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl<S> RunScanner<S>
where
    S: RunStateStore + ?Sized + 'static,
{
    pub fn new(
        roots: Vec<PathBuf>,
        marker: impl Into<String>,
        default_flags: ConversionFlags,
        store: Arc<S>,
    ) -> Self {
        Self {
            roots,
            marker: marker.into(),
            default_flags,
            store,
            lims: None,
            events: None,
        }
    }

    pub fn with_lims(mut self, lims: Arc<dyn LimsClient>) -> Self {
        self.lims = Some(lims);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn PipelineEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn default_flags(&self) -> ConversionFlags {
        self.default_flags
    }

    /// Scan using the daemon-wide default flags.
    pub async fn scan(&self) -> Result<ScanReport> {
        self.scan_with_flags(self.default_flags).await
    }

    /// Scan, registering new runs with `flags`.
    ///
    /// Store failures abort the scan; unreadable roots are skipped.
    pub async fn scan_with_flags(
        &self,
        flags: ConversionFlags,
    ) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for root in &self.roots {
            let candidates = match self.candidates(root).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(
                        target: "pipeline::scanner",
                        root = %root.display(),
                        error = %err,
                        "skipping unreadable run root"
                    );
                    continue;
                }
            };

            for dir in candidates {
                if !tokio::fs::try_exists(dir.join(&self.marker))
                    .await
                    .unwrap_or(false)
                {
                    report.incomplete += 1;
                    continue;
                }
                let run_id = match RunId::from_run_dir(&dir) {
                    Ok(run_id) => run_id,
                    Err(err) => {
                        warn!(
                            target: "pipeline::scanner",
                            dir = %dir.display(),
                            error = %err,
                            "ignoring run directory with unusable name"
                        );
                        continue;
                    }
                };
                if self.store.contains(&run_id).await? {
                    report.already_tracked += 1;
                    continue;
                }

                let run_flags = self.flags_for(&run_id, flags).await;
                let record = RunRecord::discovered(run_id.clone(), dir, run_flags);
                self.store.upsert(&record).await?;
                info!(
                    target: "pipeline::scanner",
                    run_id = %run_id,
                    path = %record.path.display(),
                    flags = ?record.flags,
                    "registered run"
                );
                self.publish_registered(&record).await;
                report.registered.push(run_id);
            }
        }

        debug!(
            target: "pipeline::scanner",
            registered = report.registered.len(),
            already_tracked = report.already_tracked,
            incomplete = report.incomplete,
            "scan finished"
        );
        Ok(report)
    }

    async fn candidates(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Applies the LIMS demultiplexing tolerance when one is known.
    async fn flags_for(
        &self,
        run_id: &RunId,
        mut flags: ConversionFlags,
    ) -> ConversionFlags {
        let Some(lims) = &self.lims else {
            return flags;
        };
        match lims.run_metadata(run_id).await {
            Ok(metadata) => {
                if let MetadataField::Available(mismatches) =
                    metadata.barcode_mismatches
                {
                    flags.barcode_mismatches = mismatches;
                }
            }
            Err(err) => {
                warn!(
                    target: "pipeline::scanner",
                    run_id = %run_id,
                    error = %err,
                    "LIMS lookup failed; registering with default flags"
                );
            }
        }
        flags
    }

    async fn publish_registered(&self, record: &RunRecord) {
        let Some(events) = &self.events else {
            return;
        };
        let event = PipelineEvent::new(
            record.run_id.clone(),
            None,
            PipelineEventPayload::Registered {
                path: record.path.display().to_string(),
            },
        );
        if let Err(err) = events.publish(event).await {
            warn!(
                target: "pipeline::scanner",
                run_id = %record.run_id,
                error = %err,
                "failed to publish registration event"
            );
        }
    }
}
