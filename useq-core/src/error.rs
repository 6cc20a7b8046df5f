use thiserror::Error;

use crate::pipeline::run::RunStatus;
use crate::types::ids::RunId;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Invalid transition for run {run_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Invalid run id: {0}")]
    InvalidRunId(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Capacity probe error: {0}")]
    Probe(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
