//! In-memory scheduler wiring shared by the integration tests.

use std::sync::Arc;

use chrono::Duration;
use scheduler_core::common::TargetId;
use scheduler_core::domains::social_profile::InMemoryTargetDirectory;
use scheduler_core::kernel::tasks::{
    AccountPool, AdmissionGate, MemoryTaskStore, QueueStats, RetryPolicy, Scheduler, TaskAdmin,
    TaskStatus, TaskStore,
};
use scheduler_core::kernel::ManualClock;

pub struct MemoryFixture {
    pub store: Arc<MemoryTaskStore>,
    pub targets: Arc<InMemoryTargetDirectory>,
    pub clock: Arc<ManualClock>,
    pub scheduler: Arc<Scheduler>,
    pub gate: AdmissionGate,
    pub admin: TaskAdmin,
}

impl MemoryFixture {
    pub fn new(accounts: &[&str]) -> Self {
        Self::with_policy(accounts, RetryPolicy::default())
    }

    pub fn with_policy(accounts: &[&str], policy: RetryPolicy) -> Self {
        let store = Arc::new(MemoryTaskStore::with_accounts(accounts.iter().copied()));
        let targets = Arc::new(InMemoryTargetDirectory::new());
        let clock = Arc::new(ManualClock::default());

        let scheduler = Arc::new(Scheduler::new(store.clone(), policy, clock.clone()));
        let gate = AdmissionGate::new(store.clone(), targets.clone(), clock.clone());
        let admin = TaskAdmin::new(store.clone(), clock.clone());

        Self {
            store,
            targets,
            clock,
            scheduler,
            gate,
            admin,
        }
    }

    pub fn target(&self) -> TargetId {
        self.targets.add()
    }

    /// Move past any backoff the default policy can produce.
    pub fn skip_backoff(&self) {
        self.clock.advance(Duration::hours(2));
    }

    pub async fn stats(&self) -> QueueStats {
        self.admin.stats().await.expect("stats")
    }

    /// Account accounting must always agree with the running tasks.
    pub async fn assert_accounting(&self) {
        let stats = self.stats().await;
        assert_eq!(
            stats.accounts_available + stats.accounts_leased,
            stats.accounts_total,
            "available + leased must equal total: {:?}",
            stats
        );
        assert_eq!(
            stats.accounts_leased - stats.accounts_unattached,
            stats.tasks_running,
            "every running task holds exactly one lease: {:?}",
            stats
        );

        let counts = self.store.task_counts().await.expect("task counts");
        assert_eq!(counts.running, stats.tasks_running);

        let accounts = self.store.list_accounts().await.expect("accounts");
        for task in self.store.tasks() {
            if task.status != TaskStatus::Running {
                assert!(task.account_id.is_none(), "lease kept by {:?}", task);
                continue;
            }
            let account = accounts
                .iter()
                .find(|a| Some(&a.id) == task.account_id.as_ref())
                .expect("running task points at a known account");
            assert!(!account.available);
            assert_eq!(account.leased_to, Some(task.id));
        }
    }
}
