//! Worker pool that executes claimed tasks against the platform client.
//!
//! # Architecture
//!
//! ```text
//! WorkerPool (Service)
//!     │
//!     └─► TaskWorker × concurrency
//!             ├─► Scheduler::next (claim task + lease account)
//!             ├─► BasePlatformClient::execute  ◄── heartbeat every interval
//!             └─► Scheduler::complete / fail
//! ```
//!
//! When nothing is claimable the worker sleeps, doubling the delay from
//! `min_poll_interval` up to `max_poll_interval`; any claim resets it.
//! Shutdown is cooperative: a worker finishes and reports its current task
//! before leaving the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::ExecutionError;
use super::scheduler::Scheduler;
use super::store::{AttemptFence, ClaimedTask, ReportOutcome};
use crate::kernel::service_host::Service;
use crate::kernel::traits::BasePlatformClient;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers
    pub concurrency: usize,
    /// Poll delay right after the queue runs dry
    pub min_poll_interval: Duration,
    /// Upper bound for the idle poll delay
    pub max_poll_interval: Duration,
    /// How often to send heartbeats for running tasks
    pub heartbeat_interval: Duration,
    /// Prefix for generated worker ids
    pub worker_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            worker_prefix: "worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    fn next_poll_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_poll_interval)
    }
}

/// A single execution unit.
pub struct TaskWorker {
    id: String,
    scheduler: Arc<Scheduler>,
    client: Arc<dyn BasePlatformClient>,
    config: WorkerPoolConfig,
}

impl TaskWorker {
    pub fn new(
        id: impl Into<String>,
        scheduler: Arc<Scheduler>,
        client: Arc<dyn BasePlatformClient>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            id: id.into(),
            scheduler,
            client,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process at most one task.
    ///
    /// Returns `None` when nothing could be claimed.
    pub async fn run_once(&self) -> Result<Option<ReportOutcome>> {
        let Some(claimed) = self.scheduler.next(&self.id).await? else {
            return Ok(None);
        };

        let outcome = self.process(claimed).await?;
        Ok(Some(outcome))
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "task worker starting");

        let mut idle = self.config.min_poll_interval;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once().await {
                Ok(Some(_)) => {
                    idle = self.config.min_poll_interval;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "task worker iteration failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(idle) => {}
            }
            idle = self.config.next_poll_interval(idle);
        }

        info!(worker_id = %self.id, "task worker stopped");
    }

    async fn process(&self, claimed: ClaimedTask) -> Result<ReportOutcome> {
        let fence = claimed.fence();

        let result = self.execute_with_heartbeat(&claimed).await;

        let reported = match result {
            Ok(value) => self.scheduler.complete(fence, Some(value)).await,
            Err(e) => self.scheduler.fail(fence, &e).await,
        };

        reported.map_err(|e| {
            // The task stays running until the reclaimer notices the silence.
            error!(
                task_id = %fence.task_id,
                attempt = fence.attempt,
                worker_id = %self.id,
                error = %e,
                "failed to report task outcome"
            );
            e
        })
    }

    /// Execute a task with periodic heartbeats.
    async fn execute_with_heartbeat(
        &self,
        claimed: &ClaimedTask,
    ) -> std::result::Result<serde_json::Value, ExecutionError> {
        let fence = claimed.fence();
        let stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.scheduler.clone(),
            fence,
            self.config.heartbeat_interval,
            stop.clone(),
        ));

        debug!(
            task_id = %fence.task_id,
            account_id = %claimed.account.id,
            worker_id = %self.id,
            "executing task"
        );
        let result = self.client.execute(&claimed.task, &claimed.account).await;

        stop.cancel();
        let _ = heartbeat.await;

        result
    }
}

async fn heartbeat_loop(
    scheduler: Arc<Scheduler>,
    fence: AttemptFence,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                match scheduler.heartbeat(fence).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            task_id = %fence.task_id,
                            attempt = fence.attempt,
                            "attempt no longer current; stopping heartbeat"
                        );
                        break;
                    }
                    Err(e) => warn!(task_id = %fence.task_id, error = %e, "heartbeat failed"),
                }
            }
        }
    }
}

/// Runs `concurrency` workers against one scheduler.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    client: Arc<dyn BasePlatformClient>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<Scheduler>, client: Arc<dyn BasePlatformClient>) -> Self {
        Self::with_config(scheduler, client, WorkerPoolConfig::default())
    }

    pub fn with_config(
        scheduler: Arc<Scheduler>,
        client: Arc<dyn BasePlatformClient>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            scheduler,
            client,
            config,
        }
    }

    fn workers(&self) -> Vec<TaskWorker> {
        let instance = Uuid::new_v4().simple().to_string();
        (0..self.config.concurrency.max(1))
            .map(|i| {
                TaskWorker::new(
                    format!("{}-{}-{}", self.config.worker_prefix, &instance[..8], i),
                    self.scheduler.clone(),
                    self.client.clone(),
                    self.config.clone(),
                )
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Service for WorkerPool {
    fn name(&self) -> &'static str {
        "task-worker-pool"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(concurrency = self.config.concurrency, "worker pool starting");

        let mut set = JoinSet::new();
        for worker in self.workers() {
            let token = shutdown.clone();
            set.spawn(async move { worker.run(token).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "task worker panicked");
            }
        }

        info!("worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_doubles_up_to_max() {
        let config = WorkerPoolConfig {
            min_poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_millis(350),
            ..Default::default()
        };

        let a = config.next_poll_interval(config.min_poll_interval);
        let b = config.next_poll_interval(a);
        let c = config.next_poll_interval(b);
        assert_eq!(a, Duration::from_millis(200));
        assert_eq!(b, Duration::from_millis(350));
        assert_eq!(c, Duration::from_millis(350));
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.worker_prefix, "worker");
    }
}
