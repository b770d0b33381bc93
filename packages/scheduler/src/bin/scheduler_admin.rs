//! Operator CLI for the scrape scheduler.
//!
//! Talks to Postgres directly and prints JSON on stdout; logs go to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scheduler_core::common::{TargetId, TaskId};
use scheduler_core::config::Config;
use scheduler_core::domains::social_profile::{PostgresTargetDirectory, SocialProfile};
use scheduler_core::kernel::tasks::{
    AccountPool, Admission, AdmissionGate, PostgresTaskStore, Scheduler, SubmitTask, TaskAdmin,
    TaskError, TaskType,
};
use scheduler_core::kernel::{Clock, SystemClock};
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scheduler-admin")]
#[command(about = "Operate the social-profile scrape scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Register the accounts listed in SCRAPE_ACCOUNTS (never removes any)
    SyncAccounts,

    /// Register a social profile as a scrape target
    AddTarget {
        platform: String,
        handle: String,
        #[arg(long)]
        url: Option<String>,
    },

    /// Create a task
    Submit {
        /// full_scrape, ai_analysis or discover
        #[arg(long = "type")]
        task_type: TaskType,
        #[arg(long)]
        target: Option<TargetId>,
        /// JSON object handed to the platform client
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Lower runs first
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        max_attempts: Option<i32>,
    },

    /// Show account and task counts
    Stats,

    /// Show one task
    Get { id: TaskId },

    /// Reset a done or failed task to pending
    Retry { id: TaskId },

    /// Cancel a task
    Cancel { id: TaskId },

    /// Change the priority of a pending task
    Reprioritize { id: TaskId, priority: i32 },

    /// Reclaim running tasks whose worker stopped heartbeating
    Reclaim,
}

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

fn output(resp: &Response) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(resp)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config.require_database_url()?)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresTaskStore::new(pool.clone()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let admin = TaskAdmin::new(store.clone(), clock.clone());

    let result: std::result::Result<serde_json::Value, TaskError> = match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            Ok(json!("migrations applied"))
        }
        Commands::SyncAccounts => {
            if config.scrape_accounts.is_empty() {
                tracing::warn!("SCRAPE_ACCOUNTS is empty; nothing to sync");
            }
            store
                .sync_accounts(&config.scrape_accounts, clock.now())
                .await?;
            Ok(serde_json::to_value(store.list_accounts().await?)?)
        }
        Commands::AddTarget {
            platform,
            handle,
            url,
        } => {
            let profile =
                SocialProfile::find_or_create(&platform, &handle, url.as_deref(), &pool).await?;
            Ok(serde_json::to_value(profile)?)
        }
        Commands::Submit {
            task_type,
            target,
            payload,
            priority,
            max_attempts,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            let gate = AdmissionGate::new(
                store.clone(),
                Arc::new(PostgresTargetDirectory::new(pool.clone())),
                clock.clone(),
            )
            .with_default_max_attempts(config.task_max_attempts);

            let request = SubmitTask::builder()
                .task_type(task_type)
                .target_id(target)
                .payload(payload)
                .priority(priority)
                .max_attempts(max_attempts)
                .build();

            gate.submit(request).await.map(|admission| match admission {
                Admission::Created(task) => json!({ "outcome": "created", "task": task }),
                Admission::Skipped(existing) => {
                    json!({ "outcome": "skipped", "existing_task_id": existing })
                }
            })
        }
        Commands::Stats => admin.stats().await.map(|stats| {
            json!({ "stats": stats, "saturated": stats.is_saturated() })
        }),
        Commands::Get { id } => admin.get(id).await.map(|task| json!(task)),
        Commands::Retry { id } => admin.retry(id).await.map(|task| json!(task)),
        Commands::Cancel { id } => admin.cancel(id).await.map(|task| json!(task)),
        Commands::Reprioritize { id, priority } => admin
            .set_priority(id, priority)
            .await
            .map(|task| json!(task)),
        Commands::Reclaim => {
            let scheduler = Scheduler::new(store.clone(), config.retry_policy(), clock.clone());
            let reclaimed = scheduler
                .reclaim_stale(config.reclaimer_config().liveness_timeout)
                .await?;
            let ids: Vec<TaskId> = reclaimed.iter().map(|r| r.task.id).collect();
            Ok(json!({ "reclaimed": ids }))
        }
    };

    match result {
        Ok(data) => output(&Response {
            success: true,
            message: None,
            data: Some(data),
        }),
        Err(e) => {
            output(&Response {
                success: false,
                message: Some(e.to_string()),
                data: None,
            })?;
            std::process::exit(1);
        }
    }
}
