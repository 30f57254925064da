//! Test harness context
//!
//! One per test binary. Owns the connection pool and the baseline snapshot
//! taken right after startup; hands out fixtures that share both.

use crate::config::HarnessSettings;
use crate::connection::TestConnection;
use crate::database::{PostgresTestDb, TransactedPostgresTestDb};
use crate::db::queries::SqlBuilder;
use crate::db::{create_pool, Executable};
use crate::error::Result;
use crate::introspection::{Snapshot, SnapshotService};
use deadpool_postgres::Pool;
use std::sync::Arc;
use tracing::info;

pub struct TestHarness {
    settings: HarnessSettings,
    pool: Pool,
    baseline: Arc<Snapshot>,
}

impl TestHarness {
    /// Create the pool, install the configured extensions and capture the baseline
    pub async fn init(settings: HarnessSettings) -> Result<Self> {
        let pool = create_pool(&settings.database)?;
        let client = pool.get().await?;

        let install = SqlBuilder::batch(
            settings
                .extensions
                .iter()
                .map(|ext| SqlBuilder::create_extension(ext, true, None)),
        );
        if let Some(install) = install {
            client
                .batch_execute(&format!("BEGIN;\n{};\nCOMMIT;", install))
                .await?;
            info!(extensions = ?settings.extensions, "Extensions installed");
        }

        let baseline = SnapshotService::capture(&client).await?;
        info!(
            schemas = baseline.schemas.len(),
            tables = baseline.tables.len(),
            extensions = baseline.extensions.len(),
            checksum = %baseline.checksum(),
            "Baseline snapshot captured for {}",
            settings.database.to_display_string()
        );

        drop(client);
        Ok(Self {
            settings,
            pool,
            baseline: Arc::new(baseline),
        })
    }

    /// [`init`](Self::init) with settings read from the environment
    pub async fn from_env() -> Result<Self> {
        Self::init(HarnessSettings::load()?).await
    }

    pub fn baseline(&self) -> Arc<Snapshot> {
        Arc::clone(&self.baseline)
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// The shared pool. Don't run DDL on it directly; use a fixture.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn checkout(&self) -> Result<TestConnection> {
        let conn = TestConnection::from_pool(&self.pool).await?;
        if let Some(megabytes) = self.settings.work_mem_mb {
            conn.set_work_mem(megabytes).await?;
        }
        Ok(conn)
    }

    /// Full-reset fixture
    pub async fn database(&self) -> Result<PostgresTestDb> {
        let conn = self.checkout().await?;
        Ok(PostgresTestDb::new(&self.settings.url, conn, Some(self.baseline())))
    }

    /// Transaction-scoped fixture
    pub async fn transacted_database(&self) -> Result<TransactedPostgresTestDb> {
        let conn = self.checkout().await?;
        TransactedPostgresTestDb::new(&self.settings.url, conn, Some(self.baseline())).await
    }

    /// Close the pool. Fixtures still alive keep their connection until dropped.
    pub fn teardown(self) {
        self.pool.close();
        info!("Test harness shut down");
    }
}
