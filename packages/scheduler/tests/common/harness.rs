//! Test harness with testcontainers for Postgres integration testing.
//!
//! One Postgres container is shared by every test in the binary. Each
//! harness gets its own freshly migrated database, so tests that claim
//! "the next task" never see each other's rows.

use anyhow::{Context, Result};
use sqlx::{Executor, PgPool};
use std::sync::Arc;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use scheduler_core::common::TargetId;
use scheduler_core::domains::social_profile::SocialProfile;
use scheduler_core::kernel::tasks::{AccountPool, PostgresTaskStore};

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    server_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let server_url = format!("postgresql://postgres:postgres@{}:{}", pg_host, pg_port);

        Ok(Self {
            server_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Test harness backed by a private database on the shared container.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// #[ignore = "requires Docker"]
/// async fn my_test(ctx: &TestHarness) {
///     let store = ctx.store();
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub store: Arc<PostgresTaskStore>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new()
            .await
            .expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("scheduler_test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&format!("{}/postgres", infra.server_url))
            .await
            .context("Failed to connect to Postgres")?;
        admin
            .execute(format!("CREATE DATABASE {}", db_name).as_str())
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let db_pool = PgPool::connect(&format!("{}/{}", infra.server_url, db_name))
            .await
            .context("Failed to connect to test database")?;

        let store = Arc::new(PostgresTaskStore::new(db_pool.clone()));
        store.migrate().await.context("Failed to run migrations")?;

        Ok(Self { db_pool, store })
    }

    pub fn store(&self) -> Arc<PostgresTaskStore> {
        self.store.clone()
    }

    pub async fn with_accounts(&self, ids: &[&str]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        self.store.sync_accounts(&ids, chrono::Utc::now()).await
    }

    /// Insert a social profile and return its id.
    pub async fn target(&self, handle: &str) -> Result<TargetId> {
        let profile = SocialProfile::find_or_create("instagram", handle, None, &self.db_pool).await?;
        Ok(profile.id)
    }
}
