pub mod event_bus;
pub mod supervisor;

pub use event_bus::{InProcPipelineEventBus, PipelineEventStream};
pub use supervisor::{CycleReport, PipelineRuntime, PipelineRuntimeBuilder};
