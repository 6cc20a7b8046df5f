pub mod budget;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod lease;
#[cfg(feature = "postgres")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
pub mod persistence;
pub mod retry;
pub mod run;
pub mod runtime;
pub mod scanner;
pub mod stages;
pub mod state_store;

pub use budget::{BudgetToken, StageBudget};
pub use config::{
    ConversionConfig, CycleConfig, LayoutConfig, OrchestratorConfig,
    RetryConfig, StageTimeouts, StorageMonitorConfig,
};
pub use dispatcher::{
    DefaultStageDispatcher, DispatchStatus, StageDispatcher, StageHandlers,
};
pub use events::{
    EventMeta, PipelineEvent, PipelineEventPayload, PipelineEventPublisher,
};
pub use lease::{LeaseId, LeaseInfo, RunLease, RunLeaseTable};
#[cfg(feature = "postgres")]
pub use persistence::PostgresRunStateStore;
pub use retry::{RetryDecision, RetryPolicy};
pub use run::{ConversionFlags, RunRecord, RunStatus, Stage};
pub use runtime::{
    CycleReport, InProcPipelineEventBus, PipelineEventStream, PipelineRuntime,
    PipelineRuntimeBuilder,
};
pub use scanner::{RunScanner, ScanReport};
pub use stages::{
    ArchiveStage, CleanupStage, ConversionStage, StageContext, StageError,
    StageHandler, StageOutcome, StageReport, TransferStage,
};
pub use state_store::{JsonFileRunStore, RunStateStore, rearm_run};
