//! Operator actions and queue statistics.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::TaskError;
use super::store::{ManualRetry, SchedulerStore};
use super::task::{Task, TaskStatus};
use crate::common::TaskId;
use crate::kernel::clock::Clock;

/// Point-in-time view of accounts and tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub accounts_total: i64,
    pub accounts_available: i64,
    pub accounts_leased: i64,
    /// Leased accounts no task holds (operator bare leases)
    pub accounts_unattached: i64,
    pub tasks_pending: i64,
    pub tasks_running: i64,
    pub tasks_done: i64,
    pub tasks_failed: i64,
}

impl QueueStats {
    /// Every account is leased while work is still waiting.
    pub fn is_saturated(&self) -> bool {
        self.accounts_available == 0 && self.tasks_pending > 0
    }
}

pub struct TaskAdmin {
    store: Arc<dyn SchedulerStore>,
    clock: Arc<dyn Clock>,
}

impl TaskAdmin {
    pub fn new(store: Arc<dyn SchedulerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(format!("task {}", id)))
    }

    /// Manual retry: done/failed tasks go back to pending with a fresh
    /// attempt budget. Pending tasks are returned unchanged.
    pub async fn retry(&self, id: TaskId) -> Result<Task, TaskError> {
        match self.store.reset_for_retry(id, self.clock.now()).await? {
            ManualRetry::Reset(task) => {
                info!(task_id = %task.id, "task reset for retry");
                Ok(task)
            }
            ManualRetry::AlreadyPending(task) => Ok(task),
            ManualRetry::Running(task) => Err(TaskError::InvalidTransition {
                task_id: task.id,
                status: task.status,
                action: "retried",
            }),
            ManualRetry::Conflict {
                target_id,
                existing,
            } => Err(TaskError::AlreadyInFlight {
                target_id,
                existing,
            }),
            ManualRetry::NotFound => Err(TaskError::NotFound(format!("task {}", id))),
        }
    }

    /// Change the priority of a pending task.
    pub async fn set_priority(&self, id: TaskId, priority: i32) -> Result<Task, TaskError> {
        match self
            .store
            .set_priority(id, priority, self.clock.now())
            .await?
        {
            Some(task) => {
                info!(task_id = %id, priority, "task reprioritized");
                Ok(task)
            }
            None => {
                let current = self.get(id).await?;
                Err(TaskError::InvalidTransition {
                    task_id: id,
                    status: current.status,
                    action: "reprioritized",
                })
            }
        }
    }

    pub async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        let task = self
            .store
            .cancel(id, self.clock.now())
            .await?
            .ok_or_else(|| TaskError::NotFound(format!("task {}", id)))?;

        match task.status {
            TaskStatus::Running => {
                info!(task_id = %id, "cancel requested; waiting for the running attempt")
            }
            _ => info!(task_id = %id, status = %task.status, "task cancelled"),
        }

        Ok(task)
    }

    pub async fn stats(&self) -> Result<QueueStats, TaskError> {
        let accounts = self.store.account_counts().await?;
        let tasks = self.store.task_counts().await?;

        Ok(QueueStats {
            accounts_total: accounts.total,
            accounts_available: accounts.available,
            accounts_leased: accounts.leased,
            accounts_unattached: accounts.unattached,
            tasks_pending: tasks.pending,
            tasks_running: tasks.running,
            tasks_done: tasks.done,
            tasks_failed: tasks.failed,
        })
    }
}
