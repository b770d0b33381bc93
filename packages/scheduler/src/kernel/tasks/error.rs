use thiserror::Error;

use super::task::{ErrorKind, TaskStatus};
use crate::common::{TargetId, TaskId};

/// Errors surfaced to callers of the submission and admin operations.
///
/// Transient execution failures never show up here; they are absorbed by
/// the retry path.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} cannot be {action} while {status}")]
    InvalidTransition {
        task_id: TaskId,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Target {target_id} already has task {existing} in flight")]
    AlreadyInFlight { target_id: TargetId, existing: TaskId },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Typed failure returned by platform clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    /// Network errors, rate limits, temporary platform errors
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    /// Failures that another attempt cannot fix (private or deleted profile)
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NonRetryable,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", err))
    }
}
