use std::{fmt, sync::Arc};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CapacityProbe, CapacityReading, StorageHandle, StorageSnapshot};
use crate::error::Result;
use crate::notify::{Notification, Notifier};
use crate::pipeline::config::StorageMonitorConfig;

/// Edge observed by a single poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageTransition {
    Unchanged,
    Breached,
    Cleared,
}

/// Polls remote capacity and publishes [`StorageSnapshot`]s.
///
/// The monitor is the only writer of the snapshot. Breach detection uses
/// hysteresis: the threshold trips when free space drops to or below
/// `threshold_bytes` and only clears once free space exceeds
/// `threshold_bytes + clear_margin_bytes`. Each edge notifies once.
pub struct StorageMonitor {
    probe: Arc<dyn CapacityProbe>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
    config: StorageMonitorConfig,
    tx: watch::Sender<StorageSnapshot>,
}

impl fmt::Debug for StorageMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageMonitor")
            .field("config", &self.config)
            .field("recipients", &self.recipients)
            .field("snapshot", &*self.tx.borrow())
            .finish()
    }
}

impl StorageMonitor {
    pub fn new(
        probe: Arc<dyn CapacityProbe>,
        notifier: Arc<dyn Notifier>,
        recipients: Vec<String>,
        config: StorageMonitorConfig,
    ) -> Self {
        let (tx, _rx) = watch::channel(StorageSnapshot::unknown());
        Self {
            probe,
            notifier,
            recipients,
            config,
            tx,
        }
    }

    pub fn handle(&self) -> StorageHandle {
        StorageHandle::new(self.tx.subscribe())
    }

    pub fn current(&self) -> StorageSnapshot {
        self.tx.borrow().clone()
    }

    pub fn config(&self) -> &StorageMonitorConfig {
        &self.config
    }

    fn breached_after(&self, was_breached: bool, free_bytes: u64) -> bool {
        if was_breached {
            let clear_at = self
                .config
                .threshold_bytes
                .saturating_add(self.config.clear_margin_bytes);
            free_bytes <= clear_at
        } else {
            free_bytes <= self.config.threshold_bytes
        }
    }

    fn next_snapshot(
        &self,
        previous: &StorageSnapshot,
        reading: CapacityReading,
    ) -> StorageSnapshot {
        let free_bytes = reading.free_bytes();
        StorageSnapshot {
            total_bytes: reading.total_bytes,
            used_bytes: reading.used_bytes,
            free_bytes,
            captured_at: Utc::now(),
            threshold_breached: self
                .breached_after(previous.threshold_breached, free_bytes),
        }
    }

    /// Query the probe once, publish the new snapshot and notify on edges.
    ///
    /// A probe failure leaves the published snapshot untouched.
    pub async fn poll_once(&self) -> Result<StorageTransition> {
        let reading = self.probe.read_capacity().await?;
        let previous = self.current();
        let snapshot = self.next_snapshot(&previous, reading);

        let transition =
            match (previous.threshold_breached, snapshot.threshold_breached) {
                (false, true) => StorageTransition::Breached,
                (true, false) => StorageTransition::Cleared,
                _ => StorageTransition::Unchanged,
            };

        self.tx.send_replace(snapshot.clone());

        debug!(
            target: "storage::monitor",
            free_bytes = snapshot.free_bytes,
            used_bytes = snapshot.used_bytes,
            total_bytes = snapshot.total_bytes,
            breached = snapshot.threshold_breached,
            "storage snapshot published"
        );

        let notification = match transition {
            StorageTransition::Breached => {
                warn!(
                    target: "storage::monitor",
                    free_bytes = snapshot.free_bytes,
                    threshold_bytes = self.config.threshold_bytes,
                    "storage threshold breached"
                );
                Some(Notification::storage_breached(
                    &self.recipients,
                    &snapshot,
                    self.config.threshold_bytes,
                ))
            }
            StorageTransition::Cleared => {
                info!(
                    target: "storage::monitor",
                    free_bytes = snapshot.free_bytes,
                    "storage threshold cleared"
                );
                Some(Notification::storage_cleared(&self.recipients, &snapshot))
            }
            StorageTransition::Unchanged => None,
        };

        if let Some(notification) = notification
            && let Err(err) = self.notifier.notify(notification).await
        {
            warn!(
                target: "storage::monitor",
                error = %err,
                "failed to deliver storage notification"
            );
        }

        Ok(transition)
    }

    /// Poll on the configured interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            target: "storage::monitor",
            interval_ms = self.config.poll_interval_ms,
            threshold_bytes = self.config.threshold_bytes,
            "storage monitor started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(
                            target: "storage::monitor",
                            error = %err,
                            "storage poll failed; keeping previous snapshot"
                        );
                    }
                }
            }
        }

        info!(target: "storage::monitor", "storage monitor stopped");
    }
}
