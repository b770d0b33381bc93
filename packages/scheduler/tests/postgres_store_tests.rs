//! PostgreSQL store integration tests.
//!
//! Each test gets a fresh database on a shared testcontainers Postgres.
//! Run with: cargo test --test postgres_store_tests -- --ignored

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::TestHarness;
use futures::future::join_all;
use scheduler_core::common::TargetId;
use scheduler_core::domains::social_profile::PostgresTargetDirectory;
use scheduler_core::kernel::tasks::{
    AccountPool, Admission, AdmissionGate, ErrorKind, ExecutionError, ManualRetry, ReportOutcome,
    RetryPolicy, Scheduler, SubmitTask, Task, TaskAdmin, TaskError, TaskStatus, TaskStore,
    TaskType,
};
use scheduler_core::kernel::{Clock, ManualClock};
use test_context::test_context;

fn scheduler_for(ctx: &TestHarness, clock: Arc<ManualClock>) -> Scheduler {
    Scheduler::new(ctx.store(), RetryPolicy::default(), clock)
}

fn scrape(target: TargetId, now: chrono::DateTime<Utc>) -> Task {
    Task::builder()
        .task_type(TaskType::FullScrape)
        .target_id(target)
        .created_at(now)
        .updated_at(now)
        .build()
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn insert_skips_target_with_task_in_flight(ctx: &TestHarness) {
    let store = ctx.store();
    let target = ctx.target("mutual_aid_mpls").await.unwrap();
    let now = Utc::now();

    let first = store.insert_unless_in_flight(scrape(target, now)).await.unwrap();
    let second = store.insert_unless_in_flight(scrape(target, now)).await.unwrap();

    assert!(first.is_created());
    assert_eq!(second, Admission::Skipped(first.task_id()));

    let in_flight = store.find_in_flight_for_target(target).await.unwrap().unwrap();
    assert_eq!(in_flight.id, first.task_id());
    assert_eq!(store.task_counts().await.unwrap().pending, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn admission_gate_checks_social_profiles(ctx: &TestHarness) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
    let gate = AdmissionGate::new(
        ctx.store(),
        Arc::new(PostgresTargetDirectory::new(ctx.db_pool.clone())),
        clock,
    );

    let known = ctx.target("northside_pantry").await.unwrap();
    assert!(gate.submit(SubmitTask::full_scrape(known)).await.unwrap().is_created());

    let err = gate
        .submit(SubmitTask::full_scrape(TargetId::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::NotFound(_)));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn claim_leases_account_and_completion_releases_it(ctx: &TestHarness) {
    ctx.with_accounts(&["acct-a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let store = ctx.store();

    let first = ctx.target("first").await.unwrap();
    let second = ctx.target("second").await.unwrap();
    store.insert_unless_in_flight(scrape(first, clock.now())).await.unwrap();
    clock.advance(Duration::seconds(1));
    store.insert_unless_in_flight(scrape(second, clock.now())).await.unwrap();

    let claimed = scheduler.next("w1").await.unwrap().expect("claim");
    assert_eq!(claimed.task.target_id, Some(first));
    assert_eq!(claimed.task.status, TaskStatus::Running);
    assert_eq!(claimed.task.attempts, 1);
    assert_eq!(claimed.account.id, "acct-a");
    assert_eq!(claimed.account.leased_to, Some(claimed.task.id));

    // The only account is leased
    assert!(scheduler.next("w2").await.unwrap().is_none());
    let counts = store.account_counts().await.unwrap();
    assert_eq!((counts.available, counts.leased), (0, 1));

    let outcome = scheduler
        .complete(claimed.fence(), Some(serde_json::json!({ "posts": 3 })))
        .await
        .unwrap();
    let ReportOutcome::Completed(done) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(done.status, TaskStatus::Done);
    assert!(done.account_id.is_none());

    let next = scheduler.next("w2").await.unwrap().expect("second claim");
    assert_eq!(next.task.target_id, Some(second));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn failures_back_off_then_fail_terminally(ctx: &TestHarness) {
    ctx.with_accounts(&["acct-a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let store = ctx.store();

    let target = ctx.target("retry_me").await.unwrap();
    store.insert_unless_in_flight(scrape(target, clock.now())).await.unwrap();

    for attempt in 1..=3 {
        let claimed = scheduler.next("w1").await.unwrap().expect("claim");
        assert_eq!(claimed.task.attempts, attempt);

        let outcome = scheduler
            .fail(claimed.fence(), &ExecutionError::retryable("429"))
            .await
            .unwrap();

        match outcome {
            ReportOutcome::Requeued(task) if attempt < 3 => {
                assert!(task.next_retry_at.is_some());
                assert!(scheduler.next("w1").await.unwrap().is_none());
                clock.advance(Duration::hours(2));
            }
            ReportOutcome::Failed(task) if attempt == 3 => {
                assert_eq!(task.status, TaskStatus::Failed);
                assert_eq!(task.error_kind, Some(ErrorKind::Retryable));
            }
            other => panic!("unexpected outcome at attempt {}: {:?}", attempt, other),
        }
    }

    assert_eq!(store.account_counts().await.unwrap().available, 1);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claimers_never_share_rows(ctx: &TestHarness) {
    ctx.with_accounts(&["a", "b", "c"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = Arc::new(scheduler_for(ctx, clock.clone()));
    let store = ctx.store();

    for i in 0..8 {
        let target = ctx.target(&format!("profile_{}", i)).await.unwrap();
        store.insert_unless_in_flight(scrape(target, clock.now())).await.unwrap();
    }

    let handles = (0..12).map(|i| {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.next(&format!("w{}", i)).await })
    });
    let claims: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(claims.len(), 3);
    let tasks: HashSet<_> = claims.iter().map(|c| c.task.id).collect();
    let accounts: HashSet<_> = claims.iter().map(|c| c.account.id.clone()).collect();
    assert_eq!(tasks.len(), 3);
    assert_eq!(accounts.len(), 3);
    assert_eq!(store.task_counts().await.unwrap().running, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_running_task_is_reclaimed(ctx: &TestHarness) {
    ctx.with_accounts(&["acct-a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let store = ctx.store();

    let target = ctx.target("gone_quiet").await.unwrap();
    store.insert_unless_in_flight(scrape(target, clock.now())).await.unwrap();
    let claimed = scheduler.next("w-lost").await.unwrap().unwrap();

    clock.advance(Duration::minutes(10));
    let reclaimed = scheduler
        .reclaim_stale(std::time::Duration::from_secs(300))
        .await
        .unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].released_account.as_deref(), Some("acct-a"));
    assert_eq!(reclaimed[0].lost_worker.as_deref(), Some("w-lost"));
    assert_eq!(reclaimed[0].task.status, TaskStatus::Pending);
    assert_eq!(reclaimed[0].task.error_kind, Some(ErrorKind::WorkerLost));
    assert_eq!(store.account_counts().await.unwrap().available, 1);

    let late = scheduler.complete(claimed.fence(), None).await.unwrap();
    assert_eq!(late, ReportOutcome::Stale);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn manual_retry_respects_in_flight_target(ctx: &TestHarness) {
    ctx.with_accounts(&["acct-a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let admin = TaskAdmin::new(ctx.store(), clock.clone());
    let store = ctx.store();

    let target = ctx.target("retry_conflict").await.unwrap();
    let mut task = scrape(target, clock.now());
    task.max_attempts = 1;
    let first = store.insert_unless_in_flight(task).await.unwrap().task_id();

    let claimed = scheduler.next("w1").await.unwrap().unwrap();
    scheduler
        .fail(claimed.fence(), &ExecutionError::non_retryable("deleted profile"))
        .await
        .unwrap();

    let second = store
        .insert_unless_in_flight(scrape(target, clock.now()))
        .await
        .unwrap();
    assert!(second.is_created());

    let conflict = store.reset_for_retry(first, clock.now()).await.unwrap();
    assert_eq!(
        conflict,
        ManualRetry::Conflict {
            target_id: target,
            existing: second.task_id(),
        }
    );

    admin.cancel(second.task_id()).await.unwrap();
    let reset = admin.retry(first).await.unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.attempts, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn sync_accounts_is_additive(ctx: &TestHarness) {
    ctx.with_accounts(&["a", "b"]).await.unwrap();
    let store = ctx.store();

    let leased = store.lease(Utc::now()).await.unwrap().expect("lease");
    ctx.with_accounts(&["b", "c"]).await.unwrap();

    let accounts = store.list_accounts().await.unwrap();
    let ids: Vec<_> = accounts.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let still_leased = accounts.iter().find(|a| a.id == leased.id).unwrap();
    assert!(!still_leased.available);

    assert_eq!(store.account_counts().await.unwrap().unattached, 1);
    assert!(store.release(&leased.id).await.unwrap());
    assert!(!store.release(&leased.id).await.unwrap());
    assert_eq!(store.account_counts().await.unwrap().available, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn report_from_before_manual_retry_is_stale(ctx: &TestHarness) {
    ctx.with_accounts(&["acct-a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let admin = TaskAdmin::new(ctx.store(), clock.clone());
    let store = ctx.store();

    let target = ctx.target("reclaimed_then_retried").await.unwrap();
    let mut task = scrape(target, clock.now());
    task.max_attempts = 1;
    let id = store.insert_unless_in_flight(task).await.unwrap().task_id();

    let lost = scheduler.next("w1").await.unwrap().unwrap();
    clock.advance(Duration::minutes(10));
    scheduler
        .reclaim_stale(std::time::Duration::from_secs(300))
        .await
        .unwrap();
    admin.retry(id).await.unwrap();
    let current = scheduler.next("w2").await.unwrap().unwrap();
    assert_eq!(lost.fence().attempt, current.fence().attempt);

    assert!(!scheduler.heartbeat(lost.fence()).await.unwrap());
    let late = scheduler
        .complete(lost.fence(), Some(serde_json::json!({ "from": "w1" })))
        .await
        .unwrap();
    assert_eq!(late, ReportOutcome::Stale);

    let counts = store.account_counts().await.unwrap();
    assert_eq!(counts.leased, store.task_counts().await.unwrap().running);

    assert!(scheduler.heartbeat(current.fence()).await.unwrap());
    let outcome = scheduler.complete(current.fence(), None).await.unwrap();
    assert!(matches!(outcome, ReportOutcome::Completed(_)));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires Docker"]
async fn release_leaves_running_lease_alone(ctx: &TestHarness) {
    ctx.with_accounts(&["a"]).await.unwrap();
    let clock = Arc::new(ManualClock::default());
    let scheduler = scheduler_for(ctx, clock.clone());
    let store = ctx.store();

    for handle in ["one", "two"] {
        let target = ctx.target(handle).await.unwrap();
        store.insert_unless_in_flight(scrape(target, clock.now())).await.unwrap();
    }

    let first = scheduler.next("w1").await.unwrap().unwrap();
    assert!(!store.release("a").await.unwrap());
    assert!(scheduler.next("w2").await.unwrap().is_none());

    let counts = store.account_counts().await.unwrap();
    assert_eq!(counts.leased, 1);
    assert_eq!(counts.unattached, 0);
    assert_eq!(counts.leased, store.task_counts().await.unwrap().running);

    scheduler.complete(first.fence(), None).await.unwrap();
    assert!(!store.release("a").await.unwrap());
    assert!(scheduler.next("w2").await.unwrap().is_some());

    let counts = store.account_counts().await.unwrap();
    assert_eq!(counts.leased, store.task_counts().await.unwrap().running);
}
