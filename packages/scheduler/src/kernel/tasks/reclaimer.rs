//! Periodic recovery of tasks whose worker went silent.
//!
//! A running task whose heartbeat is older than the liveness timeout is
//! failed with `worker_lost`: its account is released and the task goes back
//! to pending with backoff, or to failed when its attempts are used up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::scheduler::Scheduler;
use crate::kernel::service_host::Service;

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    /// How often to scan
    pub interval: Duration,
    /// A running task with no heartbeat for this long is presumed lost
    pub liveness_timeout: Duration,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            liveness_timeout: Duration::from_secs(300),
        }
    }
}

pub struct LivenessReclaimer {
    scheduler: Arc<Scheduler>,
    config: ReclaimerConfig,
}

impl LivenessReclaimer {
    pub fn new(scheduler: Arc<Scheduler>, config: ReclaimerConfig) -> Self {
        Self { scheduler, config }
    }

    /// One scan. Returns the number of reclaimed tasks.
    pub async fn run_once(&self) -> Result<usize> {
        let reclaimed = self
            .scheduler
            .reclaim_stale(self.config.liveness_timeout)
            .await?;
        Ok(reclaimed.len())
    }
}

#[async_trait::async_trait]
impl Service for LivenessReclaimer {
    fn name(&self) -> &'static str {
        "liveness-reclaimer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval = ?self.config.interval,
            liveness_timeout = ?self.config.liveness_timeout,
            "liveness reclaimer starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_once().await {
                        Ok(0) => debug!("reclaim scan found nothing"),
                        Ok(n) => info!(count = n, "reclaimed stale tasks"),
                        Err(e) => error!(error = %e, "reclaim scan failed"),
                    }
                }
            }
        }

        info!("liveness reclaimer stopped");
        Ok(())
    }
}
