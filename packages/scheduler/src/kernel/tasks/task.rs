//! Task model and lifecycle state machine.
//!
//! The transition methods on [`Task`] are the single definition of what each
//! lifecycle edge does to a record. Both stores apply them: the in-memory store
//! under its mutex, the Postgres store to a row locked `FOR UPDATE` before
//! writing the row back.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::retry::RetryDecision;
use crate::common::{TargetId, TaskId};

/// Lower numbers are claimed first.
pub const DEFAULT_PRIORITY: i32 = 5;

pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    /// Pending or running: counts against the one-task-per-target rule.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Scrape a profile and its recent posts
    FullScrape,
    /// Run AI analysis over already scraped content
    AiAnalysis,
    /// Hashtag discovery; not bound to a target
    Discover,
}

impl TaskType {
    pub fn requires_target(&self) -> bool {
        !matches!(self, TaskType::Discover)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FullScrape => "full_scrape",
            TaskType::AiAnalysis => "ai_analysis",
            TaskType::Discover => "discover",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_scrape" => Ok(TaskType::FullScrape),
            "ai_analysis" => Ok(TaskType::AiAnalysis),
            "discover" => Ok(TaskType::Discover),
            other => Err(format!("unknown task type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
    /// Cancelled by an operator
    Cancelled,
    /// Heartbeat went silent past the liveness ceiling
    WorkerLost,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::WorkerLost)
    }
}

// ============================================================================
// Task Model
// ============================================================================

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = TaskId::new())]
    pub id: TaskId,

    // Core identity
    #[builder(default, setter(strip_option))]
    pub target_id: Option<TargetId>,
    pub task_type: TaskType,

    // Scheduling
    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default = DEFAULT_PRIORITY)]
    pub priority: i32,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,

    // Attempts
    #[builder(default = 0)]
    pub attempts: i32,
    #[builder(default = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: i32,
    #[builder(default, setter(strip_option))]
    pub next_retry_at: Option<DateTime<Utc>>,

    // Lease of the running attempt
    #[builder(default, setter(strip_option))]
    pub account_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub worker_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Fresh for every claim; `attempts` alone repeats after a manual retry
    #[builder(default, setter(strip_option))]
    pub claim_token: Option<Uuid>,
    #[builder(default = false)]
    pub cancel_requested: bool,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_kind: Option<ErrorKind>,
    #[builder(default, setter(strip_option))]
    pub result: Option<serde_json::Value>,

    // Timestamps
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether a claimer may take this task at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.status != TaskStatus::Pending || self.cancel_requested {
            return false;
        }

        if self.attempts >= self.max_attempts {
            return false;
        }

        match self.next_retry_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Claim order: best priority, then oldest, then id for a total order.
    pub fn claim_key(&self) -> (i32, DateTime<Utc>, TaskId) {
        (self.priority, self.created_at, self.id)
    }

    /// pending -> running
    pub fn start_attempt(&mut self, account_id: &str, worker_id: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        self.claim_token = Some(Uuid::new_v4());
        self.next_retry_at = None;
        self.account_id = Some(account_id.to_string());
        self.worker_id = Some(worker_id.to_string());
        self.updated_at = now;
    }

    /// running -> done
    pub fn finish_success(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.status = TaskStatus::Done;
        self.completed_at = Some(now);
        self.error_message = None;
        self.error_kind = None;
        self.result = result;
        self.release_lease();
        self.updated_at = now;
    }

    /// running -> pending (retry) or running -> failed (terminal)
    pub fn finish_failure(
        &mut self,
        error: &str,
        kind: ErrorKind,
        decision: RetryDecision,
        now: DateTime<Utc>,
    ) {
        self.error_message = Some(error.to_string());
        self.error_kind = Some(kind);
        match decision {
            RetryDecision::Retry { at } => {
                self.status = TaskStatus::Pending;
                self.next_retry_at = Some(at);
            }
            RetryDecision::GiveUp => {
                self.status = TaskStatus::Failed;
                self.completed_at = Some(now);
            }
        }
        self.release_lease();
        self.updated_at = now;
    }

    /// failed/done -> pending with a fresh attempt budget
    pub fn reset_for_retry(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.attempts = 0;
        self.next_retry_at = None;
        self.error_message = None;
        self.error_kind = None;
        self.completed_at = None;
        self.cancel_requested = false;
        self.release_lease();
        self.updated_at = now;
    }

    /// Operator cancel. Pending tasks fail right away; a running task is
    /// flagged and finishes as done/failed once its worker reports.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        match self.status {
            TaskStatus::Pending => {
                self.status = TaskStatus::Failed;
                self.error_message = Some("cancelled by operator".to_string());
                self.error_kind = Some(ErrorKind::Cancelled);
                self.next_retry_at = None;
                self.completed_at = Some(now);
                self.cancel_requested = true;
                self.updated_at = now;
            }
            TaskStatus::Running => {
                self.cancel_requested = true;
                self.updated_at = now;
            }
            TaskStatus::Done | TaskStatus::Failed => {}
        }
    }

    /// Whether a report for `attempt` under `claim_token` still refers to the
    /// live attempt.
    pub fn is_current_attempt(&self, attempt: i32, claim_token: Uuid) -> bool {
        self.status == TaskStatus::Running
            && self.attempts == attempt
            && self.claim_token == Some(claim_token)
    }

    fn release_lease(&mut self) {
        self.account_id = None;
        self.worker_id = None;
        self.heartbeat_at = None;
        self.claim_token = None;
    }
}
