//! Claim protocol and outcome reporting.
//!
//! ```text
//! worker ──► Scheduler::next ──► store.claim_next (task + account, atomic)
//!    │
//!    ├─► platform client (no locks held)
//!    │
//!    └─► Scheduler::complete / fail ──► store transition + account release
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::error::ExecutionError;
use super::retry::RetryPolicy;
use super::store::{AttemptFence, ClaimedTask, ReclaimedTask, ReportOutcome, SchedulerStore};
use super::task::TaskStatus;
use crate::kernel::clock::Clock;

pub struct Scheduler {
    store: Arc<dyn SchedulerStore>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SchedulerStore>, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn SchedulerStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Claim the next eligible task for `worker_id`.
    ///
    /// `None` means either nothing is eligible or every account is leased;
    /// the caller should back off and poll again.
    pub async fn next(&self, worker_id: &str) -> Result<Option<ClaimedTask>> {
        let claimed = self.store.claim_next(worker_id, self.clock.now()).await?;

        if let Some(claimed) = &claimed {
            debug!(
                task_id = %claimed.task.id,
                task_type = %claimed.task.task_type,
                account_id = %claimed.account.id,
                worker_id = %worker_id,
                attempt = claimed.task.attempts,
                "claimed task"
            );
        }

        Ok(claimed)
    }

    pub async fn complete(
        &self,
        fence: AttemptFence,
        result: Option<serde_json::Value>,
    ) -> Result<ReportOutcome> {
        let outcome = self.store.complete(fence, result, self.clock.now()).await?;

        match &outcome {
            ReportOutcome::Stale => warn!(
                task_id = %fence.task_id,
                attempt = fence.attempt,
                "completion for a reclaimed attempt ignored"
            ),
            _ => info!(task_id = %fence.task_id, attempt = fence.attempt, "task done"),
        }

        Ok(outcome)
    }

    pub async fn fail(&self, fence: AttemptFence, error: &ExecutionError) -> Result<ReportOutcome> {
        let outcome = self
            .store
            .fail(fence, &error.message, error.kind, &self.policy, self.clock.now())
            .await?;

        match &outcome {
            ReportOutcome::Requeued(task) => warn!(
                task_id = %task.id,
                attempt = fence.attempt,
                max_attempts = task.max_attempts,
                next_retry_at = ?task.next_retry_at,
                error = %error,
                "task failed; will retry"
            ),
            ReportOutcome::Failed(task) => warn!(
                task_id = %task.id,
                attempt = fence.attempt,
                error = %error,
                error_kind = ?error.kind,
                "task failed permanently"
            ),
            ReportOutcome::Stale => warn!(
                task_id = %fence.task_id,
                attempt = fence.attempt,
                "failure for a reclaimed attempt ignored"
            ),
            ReportOutcome::Completed(_) => {}
        }

        Ok(outcome)
    }

    /// Returns false once the attempt has been reclaimed.
    pub async fn heartbeat(&self, fence: AttemptFence) -> Result<bool> {
        self.store.heartbeat(fence, self.clock.now()).await
    }

    /// Reclaim running tasks whose last heartbeat is older than `liveness_timeout`.
    pub async fn reclaim_stale(&self, liveness_timeout: Duration) -> Result<Vec<ReclaimedTask>> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(liveness_timeout)?;
        let reclaimed = self
            .store
            .reclaim_stale(now - timeout, &self.policy, now)
            .await?;

        for r in &reclaimed {
            warn!(
                task_id = %r.task.id,
                account_id = ?r.released_account,
                worker_id = ?r.lost_worker,
                requeued = r.task.status == TaskStatus::Pending,
                "reclaimed task from silent worker"
            );
        }

        Ok(reclaimed)
    }
}
