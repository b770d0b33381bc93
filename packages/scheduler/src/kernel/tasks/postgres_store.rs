//! PostgreSQL-backed scheduler store.
//!
//! Claims lock one free account row and one pending task row with
//! `FOR UPDATE SKIP LOCKED` inside a single transaction, so concurrent
//! claimers never wait on each other and never share a row. Reports lock the
//! task row, apply the [`Task`] transition in Rust and write the row back
//! together with the account release.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use super::account::{Account, AccountCounts};
use super::retry::RetryPolicy;
use super::store::{
    AccountPool, Admission, AttemptFence, ClaimedTask, ManualRetry, ReclaimedTask, ReportOutcome,
    TaskCounts, TaskStore,
};
use super::task::{ErrorKind, Task, TaskStatus};
use crate::common::{TargetId, TaskId};

macro_rules! task_columns {
    () => {
        "id, target_id, task_type, status, priority, payload, attempts, max_attempts, \
         next_retry_at, account_id, worker_id, heartbeat_at, claim_token, cancel_requested, \
         error_message, error_kind, result, started_at, completed_at, created_at, updated_at"
    };
}

macro_rules! account_columns {
    () => {
        "id, available, leased_to, last_leased_at, created_at"
    };
}

/// Insert attempts before giving up on a target whose in-flight task keeps
/// finishing between the conflict and the lookup.
const INSERT_RETRIES: usize = 3;

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn lock_task(conn: &mut PgConnection, id: TaskId) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM scrape_tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(task)
    }

    /// Write back every field a transition may change.
    async fn write_task(conn: &mut PgConnection, task: &Task) -> Result<Task> {
        let task = sqlx::query_as::<_, Task>(concat!(
            r#"
            UPDATE scrape_tasks SET
                status = $2, priority = $3, attempts = $4, next_retry_at = $5,
                account_id = $6, worker_id = $7, heartbeat_at = $8, cancel_requested = $9,
                error_message = $10, error_kind = $11, result = $12,
                started_at = $13, completed_at = $14, updated_at = $15, claim_token = $16
            WHERE id = $1
            RETURNING "#,
            task_columns!()
        ))
        .bind(task.id)
        .bind(task.status)
        .bind(task.priority)
        .bind(task.attempts)
        .bind(task.next_retry_at)
        .bind(&task.account_id)
        .bind(&task.worker_id)
        .bind(task.heartbeat_at)
        .bind(task.cancel_requested)
        .bind(&task.error_message)
        .bind(task.error_kind)
        .bind(&task.result)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.updated_at)
        .bind(task.claim_token)
        .fetch_one(&mut *conn)
        .await?;

        Ok(task)
    }

    async fn release_account_in(conn: &mut PgConnection, account_id: Option<&str>) -> Result<()> {
        if let Some(account_id) = account_id {
            sqlx::query(
                "UPDATE scrape_accounts SET available = true, leased_to = NULL WHERE id = $1",
            )
            .bind(account_id)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn in_flight_for_target(
        conn: &mut PgConnection,
        target_id: TargetId,
        excluding: Option<TaskId>,
    ) -> Result<Option<TaskId>> {
        let id = sqlx::query_scalar::<_, TaskId>(
            r#"
            SELECT id FROM scrape_tasks
            WHERE target_id = $1
              AND status IN ('pending', 'running')
              AND ($2::uuid IS NULL OR id <> $2)
            LIMIT 1
            "#,
        )
        .bind(target_id)
        .bind(excluding)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(id)
    }

    /// Fail a locked running task and release its account on `conn`.
    async fn fail_locked(
        conn: &mut PgConnection,
        mut task: Task,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<(Task, Option<String>, Option<String>)> {
        let account_id = task.account_id.clone();
        let worker_id = task.worker_id.clone();
        let decision = policy.decide(&task, kind, now);
        task.finish_failure(error, kind, decision, now);

        let task = Self::write_task(conn, &task).await?;
        Self::release_account_in(conn, account_id.as_deref()).await?;
        Ok((task, account_id, worker_id))
    }
}

fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .and_then(|e| e.as_database_error())
        .and_then(|e| e.code())
        .is_some_and(|code| code == "23505")
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert_unless_in_flight(&self, task: Task) -> Result<Admission> {
        for _ in 0..INSERT_RETRIES {
            let inserted = sqlx::query_as::<_, Task>(concat!(
                r#"
                INSERT INTO scrape_tasks (
                    id, target_id, task_type, status, priority, payload,
                    attempts, max_attempts, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (target_id) WHERE status IN ('pending', 'running') DO NOTHING
                RETURNING "#,
                task_columns!()
            ))
            .bind(task.id)
            .bind(task.target_id)
            .bind(task.task_type)
            .bind(task.status)
            .bind(task.priority)
            .bind(&task.payload)
            .bind(task.attempts)
            .bind(task.max_attempts)
            .bind(task.created_at)
            .bind(task.updated_at)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(task) = inserted {
                return Ok(Admission::Created(task));
            }

            let Some(target_id) = task.target_id else {
                return Err(anyhow!("insert of targetless task {} returned no row", task.id));
            };

            let mut conn = self.pool.acquire().await?;
            if let Some(existing) = Self::in_flight_for_target(&mut conn, target_id, None).await? {
                return Ok(Admission::Skipped(existing));
            }
            debug!(target_id = %target_id, "in-flight task finished during insert; retrying");
        }

        Err(anyhow!("could not admit task {} after {} attempts", task.id, INSERT_RETRIES))
    }

    async fn find_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM scrape_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    async fn find_in_flight_for_target(&self, target_id: TargetId) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(concat!(
            "SELECT ",
            task_columns!(),
            " FROM scrape_tasks WHERE target_id = $1 AND status IN ('pending', 'running') LIMIT 1"
        ))
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<ClaimedTask>> {
        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, Account>(concat!(
            "SELECT ",
            account_columns!(),
            r#"
            FROM scrape_accounts
            WHERE available
            ORDER BY last_leased_at ASC NULLS FIRST, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account else {
            tx.rollback().await?;
            return Ok(None);
        };

        let task = sqlx::query_as::<_, Task>(concat!(
            "SELECT ",
            task_columns!(),
            r#"
            FROM scrape_tasks
            WHERE status = 'pending'
              AND cancel_requested = false
              AND attempts < max_attempts
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
            ORDER BY priority, created_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut task) = task else {
            tx.rollback().await?;
            return Ok(None);
        };

        task.start_attempt(&account.id, worker_id, now);
        let task = Self::write_task(&mut tx, &task).await?;

        let account = sqlx::query_as::<_, Account>(concat!(
            r#"
            UPDATE scrape_accounts
            SET available = false, leased_to = $2, last_leased_at = $3
            WHERE id = $1
            RETURNING "#,
            account_columns!()
        ))
        .bind(&account.id)
        .bind(task.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(ClaimedTask { task, account }))
    }

    async fn complete(
        &self,
        fence: AttemptFence,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut task) = Self::lock_task(&mut tx, fence.task_id).await? else {
            tx.rollback().await?;
            return Ok(ReportOutcome::Stale);
        };
        if !task.is_current_attempt(fence.attempt, fence.claim_token) {
            tx.rollback().await?;
            return Ok(ReportOutcome::Stale);
        }

        let account_id = task.account_id.clone();
        task.finish_success(result, now);
        let task = Self::write_task(&mut tx, &task).await?;
        Self::release_account_in(&mut tx, account_id.as_deref()).await?;

        tx.commit().await?;
        Ok(ReportOutcome::Completed(task))
    }

    async fn fail(
        &self,
        fence: AttemptFence,
        error: &str,
        kind: ErrorKind,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(task) = Self::lock_task(&mut tx, fence.task_id).await? else {
            tx.rollback().await?;
            return Ok(ReportOutcome::Stale);
        };
        if !task.is_current_attempt(fence.attempt, fence.claim_token) {
            tx.rollback().await?;
            return Ok(ReportOutcome::Stale);
        }

        let (task, _, _) = Self::fail_locked(&mut tx, task, error, kind, policy, now).await?;
        tx.commit().await?;

        Ok(if task.status == TaskStatus::Pending {
            ReportOutcome::Requeued(task)
        } else {
            ReportOutcome::Failed(task)
        })
    }

    async fn heartbeat(&self, fence: AttemptFence, now: DateTime<Utc>) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE scrape_tasks
            SET heartbeat_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'running' AND attempts = $2 AND claim_token = $4
            "#,
        )
        .bind(fence.task_id)
        .bind(fence.attempt)
        .bind(now)
        .bind(fence.claim_token)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedTask>> {
        let mut tx = self.pool.begin().await?;

        let stale = sqlx::query_as::<_, Task>(concat!(
            "SELECT ",
            task_columns!(),
            r#"
            FROM scrape_tasks
            WHERE status = 'running'
              AND COALESCE(heartbeat_at, started_at) < $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for task in stale {
            let (task, released_account, lost_worker) = Self::fail_locked(
                &mut tx,
                task,
                "worker stopped heartbeating; attempt reclaimed",
                ErrorKind::WorkerLost,
                policy,
                now,
            )
            .await?;
            reclaimed.push(ReclaimedTask {
                task,
                released_account,
                lost_worker,
            });
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    async fn reset_for_retry(&self, id: TaskId, now: DateTime<Utc>) -> Result<ManualRetry> {
        let mut tx = self.pool.begin().await?;

        let Some(mut task) = Self::lock_task(&mut tx, id).await? else {
            tx.rollback().await?;
            return Ok(ManualRetry::NotFound);
        };

        match task.status {
            TaskStatus::Pending => {
                tx.rollback().await?;
                return Ok(ManualRetry::AlreadyPending(task));
            }
            TaskStatus::Running => {
                tx.rollback().await?;
                return Ok(ManualRetry::Running(task));
            }
            TaskStatus::Done | TaskStatus::Failed => {}
        }

        if let Some(target_id) = task.target_id {
            if let Some(existing) = Self::in_flight_for_target(&mut tx, target_id, Some(id)).await? {
                tx.rollback().await?;
                return Ok(ManualRetry::Conflict {
                    target_id,
                    existing,
                });
            }
        }

        task.reset_for_retry(now);
        let task = match Self::write_task(&mut tx, &task).await {
            Ok(task) => task,
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                // A submission for the same target won the race
                let target_id = task
                    .target_id
                    .ok_or_else(|| anyhow!("unique violation on targetless task {}", id))?;
                let existing = self
                    .find_in_flight_for_target(target_id)
                    .await?
                    .map(|t| t.id)
                    .ok_or(err)?;
                return Ok(ManualRetry::Conflict {
                    target_id,
                    existing,
                });
            }
            Err(err) => return Err(err),
        };

        tx.commit().await?;
        Ok(ManualRetry::Reset(task))
    }

    async fn set_priority(
        &self,
        id: TaskId,
        priority: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        let task = sqlx::query_as::<_, Task>(concat!(
            "UPDATE scrape_tasks SET priority = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'pending' RETURNING ",
            task_columns!()
        ))
        .bind(id)
        .bind(priority)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(task)
    }

    async fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> Result<Option<Task>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut task) = Self::lock_task(&mut tx, id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        task.cancel(now);
        let task = Self::write_task(&mut tx, &task).await?;
        tx.commit().await?;

        Ok(Some(task))
    }

    async fn task_counts(&self) -> Result<TaskCounts> {
        let rows = sqlx::query_as::<_, (TaskStatus, i64)>(
            "SELECT status, COUNT(*) FROM scrape_tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = TaskCounts::default();
        for (status, count) in rows {
            match status {
                TaskStatus::Pending => counts.pending = count,
                TaskStatus::Running => counts.running = count,
                TaskStatus::Done => counts.done = count,
                TaskStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl AccountPool for PostgresTaskStore {
    async fn sync_accounts(&self, ids: &[String], now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_accounts (id, available, created_at)
            SELECT account_id, true, $2 FROM UNNEST($1::text[]) AS account_id
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lease(&self, now: DateTime<Utc>) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(concat!(
            r#"
            UPDATE scrape_accounts
            SET available = false, leased_to = NULL, last_leased_at = $1
            WHERE id = (
                SELECT id FROM scrape_accounts
                WHERE available
                ORDER BY last_leased_at ASC NULLS FIRST, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            account_columns!()
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn release(&self, account_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        // Locking the account first waits out an in-progress claim, so the
        // task lookup below sees the holder that claim committed.
        let account = sqlx::query_as::<_, Account>(concat!(
            "SELECT ",
            account_columns!(),
            " FROM scrape_accounts WHERE id = $1 FOR UPDATE"
        ))
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account.filter(|a| !a.available) else {
            tx.rollback().await?;
            return Ok(false);
        };

        if let Some(holder) = account.leased_to {
            let running = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM scrape_tasks WHERE id = $1 AND status = 'running')",
            )
            .bind(holder)
            .fetch_one(&mut *tx)
            .await?;

            if running {
                tx.rollback().await?;
                debug!(account_id, task_id = %holder, "release ignored; lease held by running task");
                return Ok(false);
            }
        }

        Self::release_account_in(&mut tx, Some(account_id)).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(concat!(
            "SELECT ",
            account_columns!(),
            " FROM scrape_accounts ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    async fn account_counts(&self) -> Result<AccountCounts> {
        let (total, available, unattached) = sqlx::query_as::<_, (i64, i64, i64)>(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE available),
                COUNT(*) FILTER (WHERE NOT available AND leased_to IS NULL)
            FROM scrape_accounts
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AccountCounts {
            total,
            available,
            leased: total - available,
            unattached,
        })
    }
}
