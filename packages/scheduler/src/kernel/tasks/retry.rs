//! Retry/backoff policy for failed attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::task::{ErrorKind, Task};

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending, claimable again at `at`
    Retry { at: DateTime<Utc> },
    /// Terminal failure
    GiveUp,
}

/// Capped exponential backoff: `min(base * factor^(attempts - 1), cap)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    factor: u32,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(30), Duration::from_secs(3600))
    }
}

impl RetryPolicy {
    /// Doubling backoff starting at `base`, never longer than `cap`.
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            factor: 2,
            cap: cap.max(base),
        }
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }

    /// Delay before the next attempt after `attempts` attempts have failed.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
        let multiplier = self.factor.saturating_pow(exponent);
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    /// Decide where a failed running task goes next.
    pub fn decide(&self, task: &Task, kind: ErrorKind, now: DateTime<Utc>) -> RetryDecision {
        if !kind.should_retry() || task.cancel_requested || task.attempts >= task.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = chrono::Duration::from_std(self.backoff(task.attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs() as i64));
        RetryDecision::Retry { at: now + delay }
    }
}
