use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Result;

pub mod monitor;
pub mod nextcloud;

pub use monitor::{StorageMonitor, StorageTransition};
pub use nextcloud::NextcloudCapacityProbe;

/// Remote storage capacity as of the last successful poll.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub captured_at: DateTime<Utc>,
    pub threshold_breached: bool,
}

impl StorageSnapshot {
    /// Placeholder published before the first poll completes.
    pub fn unknown() -> Self {
        Self {
            total_bytes: 0,
            used_bytes: 0,
            free_bytes: 0,
            captured_at: Utc::now(),
            threshold_breached: false,
        }
    }
}

/// Raw used/total figures reported by a capacity API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityReading {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl CapacityReading {
    pub fn free_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.used_bytes)
    }
}

/// Source of remote capacity figures.
#[async_trait]
pub trait CapacityProbe: Send + Sync {
    async fn read_capacity(&self) -> Result<CapacityReading>;
}

/// Read side of the published snapshot. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StorageHandle {
    rx: watch::Receiver<StorageSnapshot>,
}

impl StorageHandle {
    pub(crate) fn new(rx: watch::Receiver<StorageSnapshot>) -> Self {
        Self { rx }
    }

    /// Handle for deployments without a capacity endpoint: never breached.
    pub fn unmonitored() -> Self {
        let (_tx, rx) = watch::channel(StorageSnapshot::unknown());
        Self { rx }
    }

    /// Immutable copy of the latest snapshot.
    pub fn snapshot(&self) -> StorageSnapshot {
        self.rx.borrow().clone()
    }

    pub fn is_breached(&self) -> bool {
        self.rx.borrow().threshold_breached
    }

    /// Wait until a new snapshot is published. Errors once the monitor is gone.
    pub async fn changed(&mut self) -> Result<StorageSnapshot> {
        self.rx.changed().await.map_err(|_| {
            crate::error::PipelineError::Cancelled(
                "storage monitor stopped".into(),
            )
        })?;
        Ok(self.rx.borrow_and_update().clone())
    }
}
