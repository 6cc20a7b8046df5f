use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{RunStatus, Stage};
use crate::error::Result;
use crate::types::ids::RunId;

/// Metadata envelope attached to every pipeline event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event emitted for one stage execution.
    pub correlation_id: Uuid,
    pub run_id: RunId,
    pub emitted_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(correlation_id: Option<Uuid>, run_id: RunId) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            run_id,
            emitted_at: Utc::now(),
        }
    }
}

/// Lifecycle facts emitted by the scanner and orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PipelineEventPayload {
    Registered {
        path: String,
    },
    StageStarted {
        stage: Stage,
        attempt: u16,
    },
    StageCompleted {
        stage: Stage,
        from: RunStatus,
        to: RunStatus,
    },
    TransferDeferred {
        reason: String,
        free_bytes: Option<u64>,
    },
    RetryScheduled {
        stage: Stage,
        attempt: u16,
        backoff_ms: u64,
        error: String,
    },
    TimedOut {
        stage: Stage,
        timeout_ms: u64,
    },
    Interrupted {
        stage: Stage,
    },
    Failed {
        stage: Stage,
        from: RunStatus,
        error: String,
    },
    Rearmed {
        to: RunStatus,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub meta: EventMeta,
    pub payload: PipelineEventPayload,
}

impl PipelineEvent {
    pub fn new(
        run_id: RunId,
        correlation_id: Option<Uuid>,
        payload: PipelineEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(correlation_id, run_id),
            payload,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.meta.run_id
    }
}

#[async_trait]
pub trait PipelineEventPublisher: Send + Sync {
    async fn publish(&self, event: PipelineEvent) -> Result<()>;
}
