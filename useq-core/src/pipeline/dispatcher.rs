use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{Instrument, debug_span, warn};

use crate::error::{PipelineError, Result};

use super::{
    config::StageTimeouts,
    run::{RunRecord, Stage},
    stages::{StageContext, StageError, StageHandler, StageOutcome, StageReport},
};

/// Outcome of dispatcher execution for a single stage attempt.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DispatchStatus {
    Success(StageReport),
    Retry { error: String },
    Failed { error: String },
    Deferred { reason: String, free_bytes: Option<u64> },
    Interrupted,
    TimedOut { timeout: Duration },
}

impl DispatchStatus {
    pub fn needs_retry(&self) -> bool {
        matches!(
            self,
            DispatchStatus::Retry { .. } | DispatchStatus::TimedOut { .. }
        )
    }
}

/// Contract exposed to the runtime for executing one stage of one run.
#[async_trait]
pub trait StageDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        run: &RunRecord,
        stage: Stage,
        ctx: &StageContext,
    ) -> DispatchStatus;
}

/// One handler per stage, each checked against the slot it fills.
#[derive(Clone)]
pub struct StageHandlers {
    conversion: Arc<dyn StageHandler>,
    transfer: Arc<dyn StageHandler>,
    cleanup: Arc<dyn StageHandler>,
    archive: Arc<dyn StageHandler>,
}

impl StageHandlers {
    pub fn new(
        conversion: Arc<dyn StageHandler>,
        transfer: Arc<dyn StageHandler>,
        cleanup: Arc<dyn StageHandler>,
        archive: Arc<dyn StageHandler>,
    ) -> Result<Self> {
        for (slot, handler) in [
            (Stage::Conversion, &conversion),
            (Stage::Transfer, &transfer),
            (Stage::Cleanup, &cleanup),
            (Stage::Archive, &archive),
        ] {
            if handler.stage() != slot {
                return Err(PipelineError::Configuration(format!(
                    "{} handler registered for the {slot} stage",
                    handler.stage()
                )));
            }
        }
        Ok(Self {
            conversion,
            transfer,
            cleanup,
            archive,
        })
    }

    pub fn for_stage(&self, stage: Stage) -> &Arc<dyn StageHandler> {
        match stage {
            Stage::Conversion => &self.conversion,
            Stage::Transfer => &self.transfer,
            Stage::Cleanup => &self.cleanup,
            Stage::Archive => &self.archive,
        }
    }
}

impl fmt::Debug for StageHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandlers")
            .field("conversion", &"StageHandler")
            .field("transfer", &"StageHandler")
            .field("cleanup", &"StageHandler")
            .field("archive", &"StageHandler")
            .finish()
    }
}

/// Runs handlers on their own task under the per-stage timeout.
///
/// A timed-out handler is aborted, which drops any child process it owns.
/// A panicking handler is reported as a retryable failure.
#[derive(Clone, Debug)]
pub struct DefaultStageDispatcher {
    handlers: StageHandlers,
    timeouts: StageTimeouts,
}

impl DefaultStageDispatcher {
    pub fn new(handlers: StageHandlers, timeouts: StageTimeouts) -> Self {
        Self { handlers, timeouts }
    }

    pub fn handlers(&self) -> &StageHandlers {
        &self.handlers
    }

    fn status_for(
        result: std::result::Result<StageOutcome, StageError>,
    ) -> DispatchStatus {
        match result {
            Ok(StageOutcome::Completed(report)) => DispatchStatus::Success(report),
            Ok(StageOutcome::Deferred { reason, free_bytes }) => {
                DispatchStatus::Deferred { reason, free_bytes }
            }
            Ok(StageOutcome::Interrupted) => DispatchStatus::Interrupted,
            Err(StageError::Transient(error)) => DispatchStatus::Retry { error },
            Err(StageError::Permanent(error)) => DispatchStatus::Failed { error },
        }
    }
}

#[async_trait]
impl StageDispatcher for DefaultStageDispatcher {
    async fn dispatch(
        &self,
        run: &RunRecord,
        stage: Stage,
        ctx: &StageContext,
    ) -> DispatchStatus {
        let handler = Arc::clone(self.handlers.for_stage(stage));
        let limit = self.timeouts.for_stage(stage);
        let span = debug_span!(
            "stage",
            run_id = %run.run_id,
            stage = %stage,
            attempt = ctx.attempt
        );

        let owned_run = run.clone();
        let owned_ctx = ctx.clone();
        let mut task = tokio::spawn(
            async move { handler.execute(&owned_run, &owned_ctx).await }
                .instrument(span),
        );

        match tokio::time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => Self::status_for(result),
            Ok(Err(join_err)) => {
                warn!(
                    target: "pipeline::stage",
                    run_id = %run.run_id,
                    %stage,
                    error = %join_err,
                    "stage task aborted"
                );
                DispatchStatus::Retry {
                    error: format!("{stage} task aborted: {join_err}"),
                }
            }
            Err(_) => {
                task.abort();
                DispatchStatus::TimedOut { timeout: limit }
            }
        }
    }
}
