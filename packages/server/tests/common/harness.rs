//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each test
//! gets its own database (created and migrated in setup) so queue polls and
//! sweeps never observe another test's rows.

use std::sync::Arc;

use anyhow::{Context, Result};
use delta_core::domains::orchestrator::Orchestrator;
use delta_core::domains::planner::{BasePlanner, Plan};
use delta_core::kernel::test_dependencies::{
    test_config, FixedPlanner, RecordingDispatcher, RecordingStatusReporter, SequentialLeaseTokens,
};
use delta_core::kernel::{AcceptAllVerifier, ServerKernel};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedTestInfra {
    admin_url: String,
    base_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Respect RUST_LOG; try_init avoids panicking on reuse.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;

        Ok(Self {
            admin_url: format!("postgresql://postgres:postgres@{host}:{port}/postgres"),
            base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
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

    /// Create a fresh, migrated database and return a pool into it.
    async fn fresh_database(&self) -> Result<PgPool> {
        let db_name = format!("delta_test_{}", Uuid::new_v4().simple());

        let admin = PgPool::connect(&self.admin_url)
            .await
            .context("Failed to connect to admin database")?;
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let pool = PgPool::connect(&format!("{}/{db_name}", self.base_url))
            .await
            .context("Failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(pool)
    }
}

/// Per-test harness: an isolated database plus factories for kernels wired
/// with recording test doubles.
pub struct TestHarness {
    pub db_pool: PgPool,
}

/// One wired control plane: orchestrator plus handles to its test doubles.
pub struct TestBed {
    pub kernel: Arc<ServerKernel>,
    pub orchestrator: Arc<Orchestrator>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub reporter: Arc<RecordingStatusReporter>,
}

impl TestHarness {
    /// Build a control plane around a fixed plan.
    pub fn bed_with_plan(&self, plan: Plan) -> TestBed {
        self.bed_with_planner(Arc::new(FixedPlanner { plan }))
    }

    pub fn bed_with_planner(&self, planner: Arc<dyn BasePlanner>) -> TestBed {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let reporter = Arc::new(RecordingStatusReporter::default());

        let kernel = Arc::new(ServerKernel::new(
            self.db_pool.clone(),
            test_config("unused://harness-owns-the-pool"),
            planner,
            dispatcher.clone(),
            reporter.clone(),
            Arc::new(SequentialLeaseTokens::default()),
            Arc::new(AcceptAllVerifier),
            None,
        ));
        let orchestrator = Arc::new(Orchestrator::new(kernel.clone()));

        TestBed {
            kernel,
            orchestrator,
            dispatcher,
            reporter,
        }
    }
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        let infra = SharedTestInfra::get().await;
        let db_pool = infra
            .fresh_database()
            .await
            .expect("Failed to create per-test database");
        Self { db_pool }
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}
