//! Global cap on simultaneous stage executions.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{PipelineError, Result};

/// A token representing one worker slot held by a stage execution
#[derive(Debug)]
pub struct BudgetToken {
    pub acquired_at: DateTime<Utc>,
    _permit: OwnedSemaphorePermit,
}

/// Worker pool budget shared by every run.
///
/// The pool size is the only global throttle on external tool invocations;
/// per-run exclusion is handled by [`super::lease::RunLeaseTable`].
#[derive(Clone)]
pub struct StageBudget {
    limit: usize,
    permits: Arc<Semaphore>,
}

impl fmt::Debug for StageBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageBudget")
            .field("limit", &self.limit)
            .field("available", &self.permits.available_permits())
            .finish()
    }
}

impl StageBudget {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Acquire a slot, waiting if all are taken
    pub async fn acquire(&self) -> Result<BudgetToken> {
        let permit =
            Arc::clone(&self.permits).acquire_owned().await.map_err(|_| {
                PipelineError::Cancelled("stage budget closed".into())
            })?;
        Ok(BudgetToken {
            acquired_at: Utc::now(),
            _permit: permit,
        })
    }

    pub fn try_acquire(&self) -> Option<BudgetToken> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| BudgetToken {
                acquired_at: Utc::now(),
                _permit: permit,
            })
    }

    /// `(in_use, limit)`
    pub fn utilization(&self) -> (usize, usize) {
        let available = self.permits.available_permits();
        (self.limit.saturating_sub(available), self.limit)
    }

    /// Wakes every waiter with an error; used during shutdown.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn caps_concurrent_tokens() {
        let budget = StageBudget::new(2);
        let a = budget.acquire().await.unwrap();
        let _b = budget.acquire().await.unwrap();
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.utilization(), (2, 2));

        drop(a);
        assert!(budget.try_acquire().is_some());
    }

    #[tokio::test]
    async fn closed_budget_rejects_waiters() {
        let budget = StageBudget::new(1);
        budget.close();
        assert!(budget.acquire().await.is_err());
    }

    #[test]
    fn zero_limit_is_raised_to_one() {
        assert_eq!(StageBudget::new(0).utilization(), (0, 1));
    }
}
