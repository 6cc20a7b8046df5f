use std::{
    any::{type_name, type_name_of_val},
    fmt,
    sync::Arc,
};

use chrono::Utc;
use dashmap::DashSet;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::lims::LimsClient;
use crate::notify::{Notification, Notifier};
use crate::pipeline::{
    budget::StageBudget,
    config::OrchestratorConfig,
    dispatcher::{DispatchStatus, StageDispatcher},
    events::{PipelineEvent, PipelineEventPayload, PipelineEventPublisher},
    lease::{RunLease, RunLeaseTable},
    retry::{RetryDecision, RetryPolicy},
    run::{RunRecord, RunStatus, Stage},
    scanner::RunScanner,
    stages::StageContext,
    state_store::{RunStateStore, rearm_run},
};
use crate::storage::StorageHandle;
use crate::types::ids::RunId;

use super::event_bus::PipelineEventStream;

/// Totals from one orchestration cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub registered: usize,
    pub dispatched: usize,
    /// Runs still held by an execution from an earlier cycle.
    pub skipped_locked: usize,
    /// Runs waiting out a retry backoff.
    pub skipped_backoff: usize,
    /// Transfers held back by the storage gate.
    pub deferred: usize,
}

/// State shared between the cycle loop and stage worker tasks.
struct RuntimeCore<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    config: OrchestratorConfig,
    store: Arc<S>,
    events: Arc<E>,
    dispatcher: Arc<dyn StageDispatcher>,
    storage: StorageHandle,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
    lims: Option<Arc<dyn LimsClient>>,
    scanner: Option<RunScanner<S>>,
    /// Serializes registration between overlapping cycles.
    scan_lock: Mutex<()>,
    leases: RunLeaseTable,
    budget: StageBudget,
    retry: RetryPolicy,
    /// Runs whose current transfer deferral has already been reported.
    deferred: DashSet<RunId>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

/// Supervises the orchestration cycle and the stage executions it spawns.
///
/// Each cycle lists active runs, takes the per-run lease for every run not
/// already in flight, and hands the matching stage to a worker task bounded
/// by the stage budget. Status changes are persisted before the next stage
/// acts on them.
pub struct PipelineRuntime<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    core: Arc<RuntimeCore<S, E>>,
    cycle_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S, E> fmt::Debug for PipelineRuntime<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycle_running = self
            .cycle_handle
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);
        f.debug_struct("PipelineRuntime")
            .field("config", &self.core.config)
            .field("store_type", &type_name::<S>())
            .field("events_type", &type_name::<E>())
            .field(
                "dispatcher_type",
                &type_name_of_val(self.core.dispatcher.as_ref()),
            )
            .field("leases", &self.core.leases)
            .field("budget", &self.core.budget)
            .field("in_flight", &self.core.tracker.len())
            .field("cycle_running", &cycle_running)
            .field(
                "shutdown_cancelled",
                &self.core.shutdown_token.is_cancelled(),
            )
            .finish()
    }
}

impl<S, E> RuntimeCore<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    async fn publish(
        &self,
        run_id: &RunId,
        correlation_id: Option<Uuid>,
        payload: PipelineEventPayload,
    ) {
        let event = PipelineEvent::new(run_id.clone(), correlation_id, payload);
        if let Err(err) = self.events.publish(event).await {
            warn!(
                target: "pipeline::cycle",
                run_id = %run_id,
                error = %err,
                "failed to publish pipeline event"
            );
        }
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        if let Some(scanner) = &self.scanner {
            let _scan = self.scan_lock.lock().await;
            report.registered = scanner.scan().await?.registered.len();
        }

        // Unreadable state aborts the whole cycle.
        let records = self.store.list_active().await?;
        let now = Utc::now();

        for record in records {
            if self.shutdown_token.is_cancelled() {
                break;
            }
            let Some(stage) = record.status.stage() else {
                continue;
            };
            if self.leases.is_held(&record.run_id) {
                report.skipped_locked += 1;
                continue;
            }
            if !record.is_due(now) {
                report.skipped_backoff += 1;
                continue;
            }
            if stage == Stage::Transfer && self.storage.is_breached() {
                self.defer_for_storage(&record.run_id, None).await;
                report.deferred += 1;
                continue;
            }
            let Some(lease) = self.leases.try_acquire(&record.run_id, stage)
            else {
                report.skipped_locked += 1;
                continue;
            };

            report.dispatched += 1;
            let core = Arc::clone(self);
            self.tracker.spawn(async move {
                core.execute(lease).await;
            });
        }

        debug!(
            target: "pipeline::cycle",
            registered = report.registered,
            dispatched = report.dispatched,
            skipped_locked = report.skipped_locked,
            skipped_backoff = report.skipped_backoff,
            deferred = report.deferred,
            "cycle complete"
        );
        Ok(report)
    }

    async fn defer_for_storage(&self, run_id: &RunId, correlation_id: Option<Uuid>) {
        let snapshot = self.storage.snapshot();
        self.note_deferral(
            run_id,
            correlation_id,
            "remote storage threshold breached".into(),
            Some(snapshot.free_bytes),
        )
        .await;
    }

    /// Reports a deferral once per episode; the episode ends when a transfer
    /// attempt returns anything other than a deferral.
    async fn note_deferral(
        &self,
        run_id: &RunId,
        correlation_id: Option<Uuid>,
        reason: String,
        free_bytes: Option<u64>,
    ) {
        if self.deferred.insert(run_id.clone()) {
            info!(
                target: "pipeline::cycle",
                run_id = %run_id,
                reason = %reason,
                free_bytes,
                "transfer deferred"
            );
            self.publish(
                run_id,
                correlation_id,
                PipelineEventPayload::TransferDeferred { reason, free_bytes },
            )
            .await;
        } else {
            debug!(
                target: "pipeline::cycle",
                run_id = %run_id,
                "transfer still deferred"
            );
        }
    }

    async fn execute(self: Arc<Self>, lease: RunLease) {
        let cancel = self.shutdown_token.clone();

        let token = tokio::select! {
            token = self.budget.acquire() => token,
            _ = cancel.cancelled() => return,
        };
        let Ok(_token) = token else {
            return;
        };
        if cancel.is_cancelled() {
            return;
        }

        // Re-read under the lease; the cycle's listing may be stale.
        let run_id = lease.run_id().clone();
        let mut record = match self.store.get(&run_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(
                    target: "pipeline::cycle",
                    run_id = %run_id,
                    error = %err,
                    "failed to reload run before dispatch"
                );
                return;
            }
        };
        let Some(stage) = record.status.stage() else {
            return;
        };
        if !record.is_due(Utc::now()) {
            return;
        }

        let correlation_id = Uuid::now_v7();

        // Storage may have breached while this run waited for a worker.
        if stage == Stage::Transfer && self.storage.is_breached() {
            self.defer_for_storage(&run_id, Some(correlation_id)).await;
            return;
        }

        match record.begin_stage(stage) {
            Ok(true) => {
                if let Err(err) = self.store.upsert(&record).await {
                    error!(
                        target: "pipeline::cycle",
                        run_id = %run_id,
                        %stage,
                        error = %err,
                        "failed to persist in-progress status; stage not started"
                    );
                    return;
                }
            }
            Ok(false) => {}
            Err(err) => {
                error!(
                    target: "pipeline::cycle",
                    run_id = %run_id,
                    %stage,
                    error = %err,
                    "run is not eligible for stage"
                );
                return;
            }
        }

        info!(
            target: "pipeline::stage",
            run_id = %run_id,
            %stage,
            attempt = record.retry_count,
            "stage started"
        );
        self.publish(
            &run_id,
            Some(correlation_id),
            PipelineEventPayload::StageStarted {
                stage,
                attempt: record.retry_count,
            },
        )
        .await;

        let ctx = StageContext::new(cancel, record.retry_count);
        let status = self.dispatcher.dispatch(&record, stage, &ctx).await;
        if stage == Stage::Transfer
            && !matches!(status, DispatchStatus::Deferred { .. })
        {
            self.deferred.remove(&run_id);
        }
        if let Err(err) = self.apply(record, stage, status, correlation_id).await
        {
            error!(
                target: "pipeline::cycle",
                run_id = %run_id,
                %stage,
                error = %err,
                "failed to persist stage outcome; stage will re-run"
            );
        }
    }

    async fn apply(
        &self,
        mut record: RunRecord,
        stage: Stage,
        status: DispatchStatus,
        correlation_id: Uuid,
    ) -> Result<()> {
        let run_id = record.run_id.clone();
        match status {
            DispatchStatus::Success(report) => {
                let from = record.status;
                if let Some(path) = report.relocated_path {
                    record.path = path;
                }
                record.advance_to(stage.success_status())?;
                self.store.upsert(&record).await?;
                info!(
                    target: "pipeline::stage",
                    run_id = %run_id,
                    %stage,
                    from = %from,
                    to = %record.status,
                    detail = report.detail.as_deref().unwrap_or(""),
                    "stage completed"
                );
                self.publish(
                    &run_id,
                    Some(correlation_id),
                    PipelineEventPayload::StageCompleted {
                        stage,
                        from,
                        to: record.status,
                    },
                )
                .await;
                Ok(())
            }
            DispatchStatus::Deferred { reason, free_bytes } => {
                self.note_deferral(&run_id, Some(correlation_id), reason, free_bytes)
                    .await;
                Ok(())
            }
            DispatchStatus::Interrupted => {
                info!(
                    target: "pipeline::stage",
                    run_id = %run_id,
                    %stage,
                    status = %record.status,
                    "stage interrupted by shutdown; will resume"
                );
                self.publish(
                    &run_id,
                    Some(correlation_id),
                    PipelineEventPayload::Interrupted { stage },
                )
                .await;
                Ok(())
            }
            DispatchStatus::TimedOut { timeout } => {
                let timeout_ms =
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    target: "pipeline::stage",
                    run_id = %run_id,
                    %stage,
                    timeout_ms,
                    "stage timed out"
                );
                self.publish(
                    &run_id,
                    Some(correlation_id),
                    PipelineEventPayload::TimedOut { stage, timeout_ms },
                )
                .await;
                let error =
                    format!("{stage} timed out after {}s", timeout.as_secs());
                self.retry_or_fail(record, stage, error, correlation_id).await
            }
            DispatchStatus::Retry { error } => {
                self.retry_or_fail(record, stage, error, correlation_id).await
            }
            DispatchStatus::Failed { error } => {
                self.fail(record, stage, error, correlation_id).await
            }
        }
    }

    async fn retry_or_fail(
        &self,
        mut record: RunRecord,
        stage: Stage,
        error: String,
        correlation_id: Uuid,
    ) -> Result<()> {
        let failed_attempts = record.retry_count.saturating_add(1);
        match self.retry.decide(&record.run_id, failed_attempts, Utc::now()) {
            RetryDecision::Retry {
                attempt,
                delay_ms,
                not_before,
            } => {
                record.record_retry(error.clone(), Some(not_before));
                self.store.upsert(&record).await?;
                warn!(
                    target: "pipeline::stage",
                    run_id = %record.run_id,
                    %stage,
                    attempt,
                    backoff_ms = delay_ms,
                    error = %error,
                    "stage failed; retry scheduled"
                );
                self.publish(
                    &record.run_id,
                    Some(correlation_id),
                    PipelineEventPayload::RetryScheduled {
                        stage,
                        attempt,
                        backoff_ms: delay_ms,
                        error,
                    },
                )
                .await;
                Ok(())
            }
            RetryDecision::Exhausted { attempts } => {
                record.retry_count = attempts;
                let error = format!("retries exhausted after {attempts} attempts: {error}");
                self.fail(record, stage, error, correlation_id).await
            }
        }
    }

    async fn fail(
        &self,
        mut record: RunRecord,
        stage: Stage,
        error: String,
        correlation_id: Uuid,
    ) -> Result<()> {
        let from = record.status;
        record.fail(error.clone())?;
        self.store.upsert(&record).await?;
        error!(
            target: "pipeline::stage",
            run_id = %record.run_id,
            %stage,
            from = %from,
            error = %error,
            "run failed"
        );
        self.publish(
            &record.run_id,
            Some(correlation_id),
            PipelineEventPayload::Failed {
                stage,
                from,
                error: error.clone(),
            },
        )
        .await;
        self.notify_failure(&record, stage, &error).await;
        Ok(())
    }

    async fn notify_failure(&self, record: &RunRecord, stage: Stage, error: &str) {
        let metadata = match &self.lims {
            Some(lims) => match lims.run_metadata(&record.run_id).await {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    warn!(
                        target: "pipeline::cycle",
                        run_id = %record.run_id,
                        error = %err,
                        "LIMS lookup failed for failure notification"
                    );
                    None
                }
            },
            None => None,
        };
        let notification = Notification::run_failed(
            &self.recipients,
            record,
            stage,
            error,
            metadata.as_ref(),
        );
        if let Err(err) = self.notifier.notify(notification).await {
            warn!(
                target: "pipeline::cycle",
                run_id = %record.run_id,
                error = %err,
                "failed to deliver failure notification"
            );
        }
    }
}

impl<S, E> PipelineRuntime<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    pub fn config(&self) -> &OrchestratorConfig {
        &self.core.config
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.core.store)
    }

    pub fn events(&self) -> Arc<E> {
        Arc::clone(&self.core.events)
    }

    pub fn leases(&self) -> RunLeaseTable {
        self.core.leases.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.core.shutdown_token.clone()
    }

    /// Run one orchestration cycle.
    ///
    /// Stage executions are spawned and keep running after this returns;
    /// use [`Self::settle`] to wait for them.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.core.run_cycle().await
    }

    /// Wait until every stage execution spawned so far has finished.
    pub async fn settle(&self) {
        self.core.tracker.close();
        self.core.tracker.wait().await;
        self.core.tracker.reopen();
    }

    /// Spawn the recurring cycle loop.
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.cycle_handle.lock().await;
        if guard.is_some() {
            return Err(PipelineError::Internal(
                "pipeline runtime already started".into(),
            ));
        }

        let core = Arc::clone(&self.core);
        let shutdown = self.core.shutdown_token.clone();
        let interval = self.core.config.cycle.interval();
        info!(
            target: "pipeline::cycle",
            interval_ms = self.core.config.cycle.interval_ms,
            max_parallel_stages = self.core.config.cycle.max_parallel_stages,
            "pipeline runtime started"
        );

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "pipeline::cycle", "cycle loop stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = core.run_cycle().await {
                            warn!(
                                target: "pipeline::cycle",
                                error = %err,
                                "cycle aborted; retrying on next tick"
                            );
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop dispatching, then give in-flight stages the configured grace
    /// period to finish or reach a checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        info!(target: "pipeline::cycle", "initiating pipeline shutdown");
        self.core.shutdown_token.cancel();

        let handle = self.cycle_handle.lock().await.take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(target: "pipeline::cycle", error = %err, "cycle loop failed");
        }

        self.core.tracker.close();
        let grace = self.core.config.cycle.shutdown_grace();
        if tokio::time::timeout(grace, self.core.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                target: "pipeline::cycle",
                in_flight = self.core.tracker.len(),
                grace_ms = self.core.config.cycle.shutdown_grace_ms,
                "stages still running after shutdown grace period"
            );
        }
        self.core.budget.close();
        info!(target: "pipeline::cycle", "pipeline shutdown complete");
        Ok(())
    }

    pub async fn status(&self, run_id: &RunId) -> Result<RunRecord> {
        self.core
            .store
            .get(run_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(run_id.clone()))
    }

    pub async fn list(&self, status: Option<RunStatus>) -> Result<Vec<RunRecord>> {
        match status {
            Some(status) => self.core.store.list_by_status(status).await,
            None => self.core.store.load().await,
        }
    }

    /// Operator action: return a failed run to the status it failed from.
    pub async fn rearm(&self, run_id: &RunId) -> Result<RunRecord> {
        let record = rearm_run(self.core.store.as_ref(), run_id).await?;
        let resumed = record.status;
        info!(
            target: "pipeline::cycle",
            run_id = %run_id,
            to = %resumed,
            "run re-armed"
        );
        self.core
            .publish(run_id, None, PipelineEventPayload::Rearmed { to: resumed })
            .await;
        Ok(record)
    }
}

/// Helper for constructing a runtime with explicit dependencies.
pub struct PipelineRuntimeBuilder<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    config: OrchestratorConfig,
    store: Option<Arc<S>>,
    events: Option<Arc<E>>,
    dispatcher: Option<Arc<dyn StageDispatcher>>,
    storage: Option<StorageHandle>,
    notifier: Option<Arc<dyn Notifier>>,
    recipients: Vec<String>,
    lims: Option<Arc<dyn LimsClient>>,
    scanner: Option<RunScanner<S>>,
}

impl<S, E> fmt::Debug for PipelineRuntimeBuilder<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PipelineRuntimeBuilder");
        debug.field("config", &self.config);
        debug.field("store_set", &self.store.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("dispatcher_set", &self.dispatcher.is_some());
        debug.field("storage_set", &self.storage.is_some());
        debug.field("notifier_set", &self.notifier.is_some());
        debug.field("recipients", &self.recipients);
        debug.field("lims_set", &self.lims.is_some());
        debug.field("scanner", &self.scanner);
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        if self.events.is_some() {
            debug.field("events_type", &type_name::<E>());
        }
        debug.finish()
    }
}

impl<S, E> PipelineRuntimeBuilder<S, E>
where
    S: RunStateStore + ?Sized + 'static,
    E: PipelineEventPublisher + PipelineEventStream + 'static,
{
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            events: None,
            dispatcher: None,
            storage: None,
            notifier: None,
            recipients: Vec::new(),
            lims: None,
            scanner: None,
        }
    }

    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_events(mut self, events: Arc<E>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn StageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_storage(mut self, storage: StorageHandle) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn Notifier>,
        recipients: Vec<String>,
    ) -> Self {
        self.notifier = Some(notifier);
        self.recipients = recipients;
        self
    }

    pub fn with_lims(mut self, lims: Arc<dyn LimsClient>) -> Self {
        self.lims = Some(lims);
        self
    }

    /// Run the scanner at the start of every cycle.
    pub fn with_scanner(mut self, scanner: RunScanner<S>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn build(self) -> Result<PipelineRuntime<S, E>> {
        let store = self.store.ok_or_else(|| {
            PipelineError::Internal("run store dependency missing".into())
        })?;
        let events = self.events.ok_or_else(|| {
            PipelineError::Internal("event publisher dependency missing".into())
        })?;
        let dispatcher = self.dispatcher.ok_or_else(|| {
            PipelineError::Internal("dispatcher dependency missing".into())
        })?;
        let storage = self.storage.ok_or_else(|| {
            PipelineError::Internal("storage handle dependency missing".into())
        })?;
        let notifier = self.notifier.ok_or_else(|| {
            PipelineError::Internal("notifier dependency missing".into())
        })?;
        if self.config.retry.max_attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }

        let budget = StageBudget::new(self.config.cycle.max_parallel_stages);
        let retry = RetryPolicy::new(self.config.retry);

        Ok(PipelineRuntime {
            core: Arc::new(RuntimeCore {
                config: self.config,
                store,
                events,
                dispatcher,
                storage,
                notifier,
                recipients: self.recipients,
                lims: self.lims,
                scanner: self.scanner,
                scan_lock: Mutex::new(()),
                leases: RunLeaseTable::new(),
                budget,
                retry,
                deferred: DashSet::new(),
                tracker: TaskTracker::new(),
                shutdown_token: CancellationToken::new(),
            }),
            cycle_handle: Mutex::new(None),
        })
    }
}
