use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::kernel::tasks::{ReclaimerConfig, RetryPolicy, WorkerPoolConfig};

/// Scheduler configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    /// Account handles provisioned for scraping (`SCRAPE_ACCOUNTS=acct-a,acct-b`)
    pub scrape_accounts: Vec<String>,
    pub worker_concurrency: usize,
    pub task_max_attempts: i32,
    pub retry_backoff_base_secs: u64,
    pub retry_backoff_cap_secs: u64,
    pub task_liveness_timeout_secs: u64,
    pub worker_heartbeat_interval_secs: u64,
    pub reclaim_interval_secs: u64,
    pub worker_min_poll_ms: u64,
    pub worker_max_poll_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            scrape_accounts: parse_account_list(
                &env::var("SCRAPE_ACCOUNTS").unwrap_or_default(),
            ),
            worker_concurrency: parse_or("WORKER_CONCURRENCY", 4)?,
            task_max_attempts: parse_or("TASK_MAX_ATTEMPTS", 3)?,
            retry_backoff_base_secs: parse_or("RETRY_BACKOFF_BASE_SECS", 30)?,
            retry_backoff_cap_secs: parse_or("RETRY_BACKOFF_CAP_SECS", 3600)?,
            task_liveness_timeout_secs: parse_or("TASK_LIVENESS_TIMEOUT_SECS", 300)?,
            worker_heartbeat_interval_secs: parse_or("WORKER_HEARTBEAT_INTERVAL_SECS", 30)?,
            reclaim_interval_secs: parse_or("RECLAIM_INTERVAL_SECS", 60)?,
            worker_min_poll_ms: parse_or("WORKER_MIN_POLL_MS", 100)?,
            worker_max_poll_ms: parse_or("WORKER_MAX_POLL_MS", 5000)?,
        })
    }

    /// Database URL, required by anything that talks to Postgres
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_secs(self.retry_backoff_base_secs),
            Duration::from_secs(self.retry_backoff_cap_secs),
        )
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.worker_concurrency,
            min_poll_interval: Duration::from_millis(self.worker_min_poll_ms),
            max_poll_interval: Duration::from_millis(self.worker_max_poll_ms),
            heartbeat_interval: Duration::from_secs(self.worker_heartbeat_interval_secs),
            ..WorkerPoolConfig::default()
        }
    }

    pub fn reclaimer_config(&self) -> ReclaimerConfig {
        ReclaimerConfig {
            interval: Duration::from_secs(self.reclaim_interval_secs),
            liveness_timeout: Duration::from_secs(self.task_liveness_timeout_secs),
        }
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number", key)),
        Err(_) => Ok(default),
    }
}

/// Split a comma separated account list, dropping blanks and duplicates.
pub fn parse_account_list(raw: &str) -> Vec<String> {
    let mut accounts: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !accounts.iter().any(|a| a == id) {
            accounts.push(id.to_string());
        }
    }
    accounts
}
