//! Validated task creation with per-target deduplication.

use std::sync::Arc;

use tracing::{debug, info};
use typed_builder::TypedBuilder;

use super::error::TaskError;
use super::store::{Admission, SchedulerStore};
use super::task::{Task, TaskStatus, TaskType, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
use crate::common::{TargetId, TaskId};
use crate::kernel::clock::Clock;
use crate::kernel::traits::BaseTargetDirectory;

/// A request to create one task.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubmitTask {
    pub task_type: TaskType,
    /// Required for `full_scrape` and `ai_analysis`, absent for `discover`
    #[builder(default)]
    pub target_id: Option<TargetId>,
    #[builder(default = serde_json::json!({}))]
    pub payload: serde_json::Value,
    /// Lower runs first; defaults to 5
    #[builder(default)]
    pub priority: Option<i32>,
    #[builder(default)]
    pub max_attempts: Option<i32>,
}

impl SubmitTask {
    pub fn full_scrape(target_id: TargetId) -> Self {
        Self::builder()
            .task_type(TaskType::FullScrape)
            .target_id(Some(target_id))
            .build()
    }

    pub fn ai_analysis(target_id: TargetId) -> Self {
        Self::builder()
            .task_type(TaskType::AiAnalysis)
            .target_id(Some(target_id))
            .build()
    }

    pub fn discover(hashtag: impl Into<String>) -> Self {
        Self::builder()
            .task_type(TaskType::Discover)
            .payload(serde_json::json!({ "hashtag": hashtag.into() }))
            .build()
    }

    fn validate(&self) -> Result<(), TaskError> {
        match (self.task_type.requires_target(), self.target_id) {
            (true, None) => {
                return Err(TaskError::Validation(format!(
                    "{} tasks require a target",
                    self.task_type
                )))
            }
            (false, Some(_)) => {
                return Err(TaskError::Validation(format!(
                    "{} tasks do not take a target",
                    self.task_type
                )))
            }
            _ => {}
        }

        if !self.payload.is_object() {
            return Err(TaskError::Validation(
                "payload must be a JSON object".to_string(),
            ));
        }

        if self.task_type == TaskType::Discover {
            let hashtag = self
                .payload
                .get("hashtag")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .unwrap_or_default();
            if hashtag.is_empty() {
                return Err(TaskError::Validation(
                    "discover tasks require a non-empty \"hashtag\" in the payload".to_string(),
                ));
            }
        }

        if let Some(max) = self.max_attempts {
            if max < 1 {
                return Err(TaskError::Validation(format!(
                    "max_attempts must be at least 1, got {}",
                    max
                )));
            }
        }

        Ok(())
    }
}

/// Entry point for creating tasks.
///
/// Targeted tasks are deduplicated: while a target has a pending or running
/// task, further requests for it are acknowledged with
/// [`Admission::Skipped`] and write nothing.
pub struct AdmissionGate {
    store: Arc<dyn SchedulerStore>,
    targets: Arc<dyn BaseTargetDirectory>,
    clock: Arc<dyn Clock>,
    default_max_attempts: i32,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn SchedulerStore>,
        targets: Arc<dyn BaseTargetDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            targets,
            clock,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub async fn submit(&self, request: SubmitTask) -> Result<Admission, TaskError> {
        request.validate()?;

        if let Some(target_id) = request.target_id {
            if !self.targets.target_exists(target_id).await? {
                return Err(TaskError::NotFound(format!("target {}", target_id)));
            }
        }

        let now = self.clock.now();
        let mut task = Task::builder()
            .id(TaskId::new())
            .task_type(request.task_type)
            .status(TaskStatus::Pending)
            .priority(request.priority.unwrap_or(DEFAULT_PRIORITY))
            .payload(request.payload)
            .max_attempts(request.max_attempts.unwrap_or(self.default_max_attempts))
            .created_at(now)
            .updated_at(now)
            .build();
        task.target_id = request.target_id;

        let admission = self.store.insert_unless_in_flight(task).await?;

        match &admission {
            Admission::Created(task) => info!(
                task_id = %task.id,
                task_type = %task.task_type,
                target_id = ?task.target_id,
                priority = task.priority,
                "task created"
            ),
            Admission::Skipped(existing) => debug!(
                existing = %existing,
                target_id = ?request.target_id,
                task_type = %request.task_type,
                "target already has a task in flight; skipped"
            ),
        }

        Ok(admission)
    }
}
