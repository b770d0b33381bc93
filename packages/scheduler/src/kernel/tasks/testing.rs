//! Test doubles for task execution.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::account::Account;
use super::error::ExecutionError;
use super::task::Task;
use crate::common::TaskId;
use crate::kernel::traits::BasePlatformClient;

/// One recorded call to [`MockPlatformClient::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionCall {
    pub task_id: TaskId,
    pub account_id: String,
    pub attempt: i32,
}

/// A platform client that replays scripted outcomes.
///
/// Outcomes are consumed in call order; once the script is empty every call
/// succeeds with `{"ok": true}`. Records every invocation and flags any
/// account used by two executions at the same time.
pub struct MockPlatformClient {
    script: Mutex<VecDeque<Result<serde_json::Value, ExecutionError>>>,
    calls: RwLock<Vec<ExecutionCall>>,
    accounts_in_use: Mutex<HashSet<String>>,
    overlap: AtomicBool,
    delay: Option<Duration>,
}

impl Default for MockPlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatformClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: RwLock::new(Vec::new()),
            accounts_in_use: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
            delay: None,
        }
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for a future call.
    pub fn push_outcome(&self, outcome: Result<serde_json::Value, ExecutionError>) -> &Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
        self
    }

    pub fn push_failure(&self, error: ExecutionError) -> &Self {
        self.push_outcome(Err(error))
    }

    pub fn calls(&self) -> Vec<ExecutionCall> {
        self.calls
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether any account was seen in two executions at once.
    pub fn saw_account_overlap(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BasePlatformClient for MockPlatformClient {
    async fn execute(
        &self,
        task: &Task,
        account: &Account,
    ) -> Result<serde_json::Value, ExecutionError> {
        self.calls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(ExecutionCall {
                task_id: task.id,
                account_id: account.id.clone(),
                attempt: task.attempts,
            });

        let fresh = self
            .accounts_in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account.id.clone());
        if !fresh {
            self.overlap.store(true, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.accounts_in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&account.id);

        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(serde_json::json!({ "ok": true })))
    }
}
