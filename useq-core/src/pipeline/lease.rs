use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::Stage;
use crate::types::ids::RunId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Holder metadata for an acquired run lease.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub lease_id: LeaseId,
    pub stage: Stage,
    pub acquired_at: DateTime<Utc>,
}

/// Exclusive per-run locks shared by every orchestration cycle.
///
/// A run appears in the table while one stage execution for it is in flight.
#[derive(Clone, Default)]
pub struct RunLeaseTable {
    leases: Arc<DashMap<RunId, LeaseInfo>>,
}

impl fmt::Debug for RunLeaseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLeaseTable")
            .field("held", &self.leases.len())
            .finish()
    }
}

impl RunLeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lease for `run_id`, or `None` if it is already held.
    pub fn try_acquire(&self, run_id: &RunId, stage: Stage) -> Option<RunLease> {
        match self.leases.entry(run_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let info = LeaseInfo {
                    lease_id: LeaseId::new(),
                    stage,
                    acquired_at: Utc::now(),
                };
                slot.insert(info);
                Some(RunLease {
                    table: Arc::clone(&self.leases),
                    run_id: run_id.clone(),
                    info,
                })
            }
        }
    }

    pub fn is_held(&self, run_id: &RunId) -> bool {
        self.leases.contains_key(run_id)
    }

    pub fn held(&self) -> usize {
        self.leases.len()
    }

    pub fn holder(&self, run_id: &RunId) -> Option<LeaseInfo> {
        self.leases.get(run_id).map(|entry| *entry.value())
    }
}

/// Guard for one run lease. Dropping it releases the run.
pub struct RunLease {
    table: Arc<DashMap<RunId, LeaseInfo>>,
    run_id: RunId,
    info: LeaseInfo,
}

impl RunLease {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }
}

impl fmt::Debug for RunLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLease")
            .field("run_id", &self.run_id)
            .field("lease_id", &self.info.lease_id)
            .field("stage", &self.info.stage)
            .finish()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let lease_id = self.info.lease_id;
        self.table
            .remove_if(&self.run_id, |_, held| held.lease_id == lease_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_while_held() {
        let table = RunLeaseTable::new();
        let run = RunId::new("R1").unwrap();

        let lease = table.try_acquire(&run, Stage::Conversion);
        assert!(lease.is_some());
        assert!(table.try_acquire(&run, Stage::Conversion).is_none());
        assert!(table.is_held(&run));

        drop(lease);
        assert!(!table.is_held(&run));
        assert!(table.try_acquire(&run, Stage::Transfer).is_some());
    }

    #[test]
    fn distinct_runs_lease_independently() {
        let table = RunLeaseTable::new();
        let a = table.try_acquire(&RunId::new("A").unwrap(), Stage::Conversion);
        let b = table.try_acquire(&RunId::new("B").unwrap(), Stage::Archive);
        assert!(a.is_some() && b.is_some());
        assert_eq!(table.held(), 2);
    }

    #[test]
    fn clones_share_the_same_table() {
        let table = RunLeaseTable::new();
        let other = table.clone();
        let run = RunId::new("R1").unwrap();
        let _lease = table.try_acquire(&run, Stage::Cleanup).unwrap();
        assert!(other.try_acquire(&run, Stage::Cleanup).is_none());
        assert_eq!(other.holder(&run).map(|info| info.stage), Some(Stage::Cleanup));
    }
}
