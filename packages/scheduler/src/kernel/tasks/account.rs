use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::common::TaskId;

/// A platform credential that at most one running task may hold.
#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub available: bool,
    pub leased_to: Option<TaskId>,
    pub last_leased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            available: true,
            leased_to: None,
            last_leased_at: None,
            created_at: now,
        }
    }

    /// Least-recently-used first; never-leased accounts before any leased one.
    pub fn lease_key(&self) -> (Option<DateTime<Utc>>, &str) {
        (self.last_leased_at, self.id.as_str())
    }

    pub(crate) fn mark_leased(&mut self, task_id: Option<TaskId>, now: DateTime<Utc>) {
        self.available = false;
        self.leased_to = task_id;
        self.last_leased_at = Some(now);
    }

    pub(crate) fn mark_released(&mut self) {
        self.available = true;
        self.leased_to = None;
    }
}

/// Availability accounting derived from per-account state.
///
/// `leased` includes `unattached`: bare leases taken through
/// `AccountPool::lease` that no task holds. Leases held by running tasks
/// are `leased - unattached`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCounts {
    pub total: i64,
    pub available: i64,
    pub leased: i64,
    pub unattached: i64,
}

impl AccountCounts {
    pub fn held_by_tasks(&self) -> i64 {
        self.leased - self.unattached
    }
}
