//! In-memory scheduler backend.
//!
//! Tasks and accounts live behind one mutex, so every trait method is a
//! single critical section spanning both tables. Nothing awaits while the
//! lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::account::{Account, AccountCounts};
use super::retry::RetryPolicy;
use super::store::{
    AccountPool, Admission, AttemptFence, ClaimedTask, ManualRetry, ReclaimedTask, ReportOutcome,
    TaskCounts, TaskStore,
};
use super::task::{ErrorKind, Task, TaskStatus};
use crate::common::{TargetId, TaskId};

#[derive(Default)]
struct State {
    tasks: HashMap<TaskId, Task>,
    accounts: BTreeMap<String, Account>,
}

impl State {
    fn in_flight_for_target(&self, target_id: TargetId) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.target_id == Some(target_id) && t.status.is_in_flight())
    }

    fn next_free_account(&self) -> Option<String> {
        self.accounts
            .values()
            .filter(|a| a.available)
            .min_by(|a, b| a.lease_key().cmp(&b.lease_key()))
            .map(|a| a.id.clone())
    }

    fn release_account(&mut self, account_id: Option<&str>) {
        if let Some(account) = account_id.and_then(|id| self.accounts.get_mut(id)) {
            account.mark_released();
        }
    }

    fn fail_running(
        &mut self,
        id: TaskId,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Option<(Task, Option<String>, Option<String>)> {
        let task = self.tasks.get_mut(&id)?;
        let account_id = task.account_id.clone();
        let worker_id = task.worker_id.clone();
        let decision = policy.decide(task, kind, now);
        task.finish_failure(error, kind, decision, now);
        let task = task.clone();
        self.release_account(account_id.as_deref());
        Some((task, account_id, worker_id))
    }
}

/// Scheduler backend for tests and single-process embedding.
#[derive(Default)]
pub struct MemoryTaskStore {
    state: Mutex<State>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with `ids` provisioned as free accounts.
    pub fn with_accounts<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        let store = Self::new();
        {
            let mut state = store.lock();
            for id in ids {
                let account = Account::new(id, now);
                state.accounts.insert(account.id.clone(), account);
            }
        }
        store
    }

    /// Snapshot of every task, oldest first.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_unless_in_flight(&self, task: Task) -> Result<Admission> {
        let mut state = self.lock();

        if let Some(target_id) = task.target_id {
            if let Some(existing) = state.in_flight_for_target(target_id) {
                return Ok(Admission::Skipped(existing.id));
            }
        }

        state.tasks.insert(task.id, task.clone());
        Ok(Admission::Created(task))
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(&id).cloned())
    }

    async fn find_in_flight_for_target(&self, target_id: TargetId) -> Result<Option<Task>> {
        Ok(self.lock().in_flight_for_target(target_id).cloned())
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedTask>> {
        let mut state = self.lock();

        let Some(task_id) = state
            .tasks
            .values()
            .filter(|t| t.is_claimable(now))
            .min_by_key(|t| t.claim_key())
            .map(|t| t.id)
        else {
            return Ok(None);
        };

        let Some(account_id) = state.next_free_account() else {
            return Ok(None);
        };

        let account = match state.accounts.get_mut(&account_id) {
            Some(account) => {
                account.mark_leased(Some(task_id), now);
                account.clone()
            }
            None => return Ok(None),
        };

        let task = match state.tasks.get_mut(&task_id) {
            Some(task) => {
                task.start_attempt(&account.id, worker_id, now);
                task.clone()
            }
            None => return Ok(None),
        };

        Ok(Some(ClaimedTask { task, account }))
    }

    async fn complete(
        &self,
        fence: AttemptFence,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        let mut state = self.lock();

        let Some(task) = state.tasks.get_mut(&fence.task_id) else {
            return Ok(ReportOutcome::Stale);
        };
        if !task.is_current_attempt(fence.attempt, fence.claim_token) {
            return Ok(ReportOutcome::Stale);
        }

        let account_id = task.account_id.clone();
        task.finish_success(result, now);
        let task = task.clone();
        state.release_account(account_id.as_deref());

        Ok(ReportOutcome::Completed(task))
    }

    async fn fail(
        &self,
        fence: AttemptFence,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        let mut state = self.lock();

        let current = state
            .tasks
            .get(&fence.task_id)
            .is_some_and(|t| t.is_current_attempt(fence.attempt, fence.claim_token));
        if !current {
            return Ok(ReportOutcome::Stale);
        }

        Ok(match state.fail_running(fence.task_id, error, kind, policy, now) {
            Some((task, _, _)) if task.status == TaskStatus::Pending => ReportOutcome::Requeued(task),
            Some((task, _, _)) => ReportOutcome::Failed(task),
            None => ReportOutcome::Stale,
        })
    }

    async fn heartbeat(&self, fence: AttemptFence, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.lock();
        match state.tasks.get_mut(&fence.task_id) {
            Some(task) if task.is_current_attempt(fence.attempt, fence.claim_token) => {
                task.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedTask>> {
        let mut state = self.lock();

        let stale: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.heartbeat_at.or(t.started_at).map_or(true, |at| at < cutoff)
            })
            .map(|t| t.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let message = "worker stopped heartbeating; attempt reclaimed";
            if let Some((task, released_account, lost_worker)) =
                state.fail_running(id, message, ErrorKind::WorkerLost, policy, now)
            {
                reclaimed.push(ReclaimedTask {
                    task,
                    released_account,
                    lost_worker,
                });
            }
        }

        Ok(reclaimed)
    }

    async fn reset_for_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<ManualRetry> {
        let mut state = self.lock();

        let Some(task) = state.tasks.get(&id) else {
            return Ok(ManualRetry::NotFound);
        };

        match task.status {
            TaskStatus::Pending => return Ok(ManualRetry::AlreadyPending(task.clone())),
            TaskStatus::Running => return Ok(ManualRetry::Running(task.clone())),
            TaskStatus::Done | TaskStatus::Failed => {}
        }

        if let Some(target_id) = task.target_id {
            if let Some(existing) = state.in_flight_for_target(target_id) {
                return Ok(ManualRetry::Conflict {
                    target_id,
                    existing: existing.id,
                });
            }
        }

        match state.tasks.get_mut(&id) {
            Some(task) => {
                task.reset_for_retry(now);
                Ok(ManualRetry::Reset(task.clone()))
            }
            None => Ok(ManualRetry::NotFound),
        }
    }

    async fn set_priority(
        &self,
        id: TaskId,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let mut state = self.lock();
        Ok(state
            .tasks
            .get_mut(&id)
            .filter(|task| task.status == TaskStatus::Pending)
            .map(|task| {
                task.priority = priority;
                task.updated_at = now;
                task.clone()
            }))
    }

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut state = self.lock();
        Ok(state.tasks.get_mut(&id).map(|task| {
            task.cancel(now);
            task.clone()
        }))
    }

    async fn task_counts(&self) -> Result<TaskCounts> {
        let state = self.lock();
        let mut counts = TaskCounts::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl AccountPool for MemoryTaskStore {
    async fn sync_accounts(&self, ids: &[String], now: DateTime<Utc>) -> Result<()> {
        let mut state = self.lock();
        for id in ids {
            state
                .accounts
                .entry(id.clone())
                .or_insert_with(|| Account::new(id.clone(), now));
        }
        Ok(())
    }

    async fn lease(&self, now: DateTime<Utc>) -> Result<Option<Account>> {
        let mut state = self.lock();
        let Some(account_id) = state.next_free_account() else {
            return Ok(None);
        };
        Ok(state.accounts.get_mut(&account_id).map(|account| {
            account.mark_leased(None, now);
            account.clone()
        }))
    }

    async fn release(&self, account_id: &str) -> Result<bool> {
        let mut state = self.lock();

        let Some(account) = state.accounts.get(account_id) else {
            return Ok(false);
        };
        if account.available {
            return Ok(false);
        }
        let held_by_running = account
            .leased_to
            .and_then(|task_id| state.tasks.get(&task_id))
            .is_some_and(|task| task.status == TaskStatus::Running);
        if held_by_running {
            return Ok(false);
        }

        state.release_account(Some(account_id));
        Ok(true)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.lock().accounts.values().cloned().collect())
    }

    async fn account_counts(&self) -> Result<AccountCounts> {
        let state = self.lock();
        let total = state.accounts.len() as i64;
        let available = state.accounts.values().filter(|a| a.available).count() as i64;
        let unattached = state
            .accounts
            .values()
            .filter(|a| !a.available && a.leased_to.is_none())
            .count() as i64;
        Ok(AccountCounts {
            total,
            available,
            leased: total - available,
            unattached,
        })
    }
}
