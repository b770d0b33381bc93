//! Account-constrained task scheduling.
//!
//! This module provides the scheduling core for the scraping pipeline:
//! - [`AdmissionGate`] - Validated task creation, one in-flight task per target
//! - [`Scheduler`] - Claims the best eligible task together with a free account
//! - [`WorkerPool`] - Long-running service that executes claimed tasks
//! - [`LivenessReclaimer`] - Recovers tasks whose worker stopped heartbeating
//! - [`TaskAdmin`] - Manual retry, priority override, cancel and stats
//!
//! # Architecture
//!
//! ```text
//! submit(target, type, payload, priority)
//!     │
//!     └─► AdmissionGate ──► TaskStore (pending)
//!
//! WorkerPool
//!     │
//!     ├─► Scheduler::next ──► claim task + lease account (one atomic step)
//!     ├─► BasePlatformClient::execute
//!     └─► complete / fail ──► RetryPolicy ──► pending (backoff) | done | failed
//!                                          └─► account released
//! ```
//!
//! # Task Lifecycle
//!
//! ```text
//! pending ──claim──► running ──ok──────────────► done
//!    ▲                  │
//!    └──retry/backoff───┤
//!                       └──attempts exhausted──► failed
//! ```
//!
//! `done` and `failed` are terminal until an operator retries the task.

mod account;
mod admin;
mod admission;
mod error;
mod memory_store;
mod postgres_store;
mod reclaimer;
mod retry;
mod scheduler;
mod store;
mod task;
pub mod testing;
mod worker;

pub use account::{Account, AccountCounts};
pub use admin::{QueueStats, TaskAdmin};
pub use admission::{AdmissionGate, SubmitTask};
pub use error::{ExecutionError, TaskError};
pub use memory_store::MemoryTaskStore;
pub use postgres_store::PostgresTaskStore;
pub use reclaimer::{LivenessReclaimer, ReclaimerConfig};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use store::{
    AccountPool, Admission, AttemptFence, ClaimedTask, ManualRetry, ReclaimedTask, ReportOutcome,
    SchedulerStore, TaskCounts, TaskStore,
};
pub use task::{ErrorKind, Task, TaskStatus, TaskType, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY};
pub use worker::{TaskWorker, WorkerPool, WorkerPoolConfig};
