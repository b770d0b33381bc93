//! Repository traits for task and account state.
//!
//! Every method is one atomic operation against the backing store. The claim
//! path ([`TaskStore::claim_next`]) and the reporting paths (`complete`,
//! `fail`, `reclaim_stale`) touch a task and its account together, so both
//! traits are implemented by the same backend; see [`SchedulerStore`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::{Account, AccountCounts};
use super::retry::RetryPolicy;
use super::task::{ErrorKind, Task};
use crate::common::{TargetId, TaskId};

/// Result of a creation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A new pending task was inserted
    Created(Task),
    /// The target already has a pending or running task; nothing was written
    Skipped(TaskId),
}

impl Admission {
    /// The new task id, or the id of the in-flight task that caused the skip
    pub fn task_id(&self) -> TaskId {
        match self {
            Admission::Created(task) => task.id,
            Admission::Skipped(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// Identifies one claim of one task. Reports carrying a fence that no
/// longer matches the stored claim are discarded.
///
/// `attempt` repeats once a manual retry resets the budget, so the match is
/// on `claim_token`, which every claim draws fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFence {
    pub task_id: TaskId,
    pub attempt: i32,
    pub claim_token: Uuid,
}

/// A task handed to a worker together with the account it leased.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: Task,
    pub account: Account,
}

impl ClaimedTask {
    pub fn fence(&self) -> AttemptFence {
        AttemptFence {
            task_id: self.task.id,
            attempt: self.task.attempts,
            claim_token: self.task.claim_token.unwrap_or_default(),
        }
    }
}

/// What a completion or failure report did.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Completed(Task),
    /// Back to pending with a retry time
    Requeued(Task),
    /// Terminal failure
    Failed(Task),
    /// The attempt was already reclaimed or finished; nothing changed
    Stale,
}

impl ReportOutcome {
    pub fn task(&self) -> Option<&Task> {
        match self {
            ReportOutcome::Completed(task)
            | ReportOutcome::Requeued(task)
            | ReportOutcome::Failed(task) => Some(task),
            ReportOutcome::Stale => None,
        }
    }
}

/// A running task taken back from a silent worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReclaimedTask {
    pub task: Task,
    pub released_account: Option<String>,
    pub lost_worker: Option<String>,
}

/// Store-level result of a manual retry request.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualRetry {
    /// done/failed task reset to pending
    Reset(Task),
    /// Already pending; left as is
    AlreadyPending(Task),
    /// Running tasks cannot be reset
    Running(Task),
    /// Another task for the same target is in flight
    Conflict { target_id: TargetId, existing: TaskId },
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert `task` unless its target already has an in-flight task.
    async fn insert_unless_in_flight(&self, task: Task) -> Result<Admission>;

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    async fn find_in_flight_for_target(&self, target_id: TargetId) -> Result<Option<Task>>;

    /// Claim the best eligible task and lease an account to it in one step.
    /// Returns `None` when no task is eligible or no account is free; in both
    /// cases nothing is modified.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedTask>>;

    /// running -> done, releasing the account.
    async fn complete(
        &self,
        fence: AttemptFence,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome>;

    /// running -> pending/failed per `policy`, releasing the account.
    async fn fail(
        &self,
        fence: AttemptFence,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome>;

    /// Refresh the liveness timestamp. Returns false for stale fences.
    async fn heartbeat(&self, fence: AttemptFence, now: DateTime<Utc>) -> Result<bool>;

    /// Fail every running task whose heartbeat is older than `cutoff`.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedTask>>;

    async fn reset_for_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<ManualRetry>;

    /// Only pending tasks are updated; `None` otherwise.
    async fn set_priority(
        &self,
        id: TaskId,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<Task>>;

    async fn task_counts(&self) -> Result<TaskCounts>;
}

#[async_trait]
pub trait AccountPool: Send + Sync {
    /// Make sure every configured account exists. Never removes accounts.
    async fn sync_accounts(&self, ids: &[String], now: DateTime<Utc>) -> Result<()>;

    /// Lease the least-recently-used free account, or `None` without waiting.
    ///
    /// Workers lease through [`TaskStore::claim_next`]; a bare lease is for
    /// operator tooling and must be paired with [`AccountPool::release`].
    /// It holds no task, so [`AccountCounts::unattached`] counts it apart
    /// from the leases held by running tasks.
    async fn lease(&self, now: DateTime<Utc>) -> Result<Option<Account>>;

    /// Idempotent; releasing a free or unknown account is a no-op. So is
    /// releasing an account whose lease belongs to a task that is still
    /// running: that lease ends only through the task's own report or a
    /// reclaim. Returns whether the account was freed.
    async fn release(&self, account_id: &str) -> Result<bool>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn account_counts(&self) -> Result<AccountCounts>;
}

/// A backend holding both tasks and accounts.
pub trait SchedulerStore: TaskStore + AccountPool {}

impl<T: TaskStore + AccountPool> SchedulerStore for T {}
