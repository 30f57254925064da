//! Test database fixtures
//!
//! Two flavors share one core:
//! - [`PostgresTestDb`]: full reset. Tests may commit; teardown restores the
//!   baseline snapshot if anything drifted.
//! - [`TransactedPostgresTestDb`]: every test runs inside one transaction that
//!   is rolled back at reset. Drift after the rollback is an error.

pub mod reset;
pub mod transacted;

pub use reset::PostgresTestDb;
pub use transacted::TransactedPostgresTestDb;

use crate::connection::TestConnection;
use crate::db::queries::{self, SqlBuilder};
use crate::db::Executable;
use crate::error::{HarnessError, Result};
use crate::introspection::{Snapshot, SnapshotService};
use crate::snapshot::{DriftDetector, DriftReport, RestoreEngine, RestoreSummary};
use crate::time::TimeFreezer;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;
use tracing::{debug, info, warn};

/// Options for [`DatabaseCore::install_extension`]
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Skip quietly when the server doesn't ship the extension
    pub if_available: bool,
    /// Don't fail if it is already installed
    pub exists_ok: bool,
    /// Schema to install into, the server default otherwise
    pub schema: Option<String>,
}

/// State and helpers shared by both fixture flavors
pub struct DatabaseCore {
    url: String,
    conn: TestConnection,
    baseline: Option<Arc<Snapshot>>,
    time: TimeFreezer,
}

impl DatabaseCore {
    pub fn new(url: impl Into<String>, conn: TestConnection, baseline: Option<Arc<Snapshot>>) -> Self {
        let time = TimeFreezer::for_connection(&conn);
        Self {
            url: url.into(),
            conn,
            baseline,
            time,
        }
    }

    /// Connection URL of the test database
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The fixture's connection. Statements sent through it see frozen time.
    pub fn connection(&self) -> &TestConnection {
        &self.conn
    }

    pub fn baseline(&self) -> Option<&Snapshot> {
        self.baseline.as_deref()
    }

    /// Time control for this fixture's connection
    pub fn time(&self) -> &TimeFreezer {
        &self.time
    }

    /// True unless the catalog matches the baseline exactly.
    /// Fails with [`HarnessError::NoSnapshot`] when there is no baseline.
    pub async fn is_dirty(&self) -> Result<bool> {
        let baseline = self.baseline().ok_or(HarnessError::NoSnapshot)?;
        DriftDetector::is_dirty(&self.conn, baseline).await
    }

    /// Full drift report against the baseline
    pub async fn drift_report(&self) -> Result<DriftReport> {
        let baseline = self.baseline().ok_or(HarnessError::NoSnapshot)?;
        DriftDetector::report(&self.conn, baseline).await
    }

    /// Capture the current state
    pub async fn snapshot(&self) -> Result<Snapshot> {
        SnapshotService::capture(&self.conn).await
    }

    /// Put the database back into its baseline state
    pub async fn restore_to_snapshot(&self) -> Result<RestoreSummary> {
        RestoreEngine::restore(&self.conn, self.baseline()).await
    }

    async fn exists(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<bool> {
        let row = self.conn.query_one(sql, params).await?;
        Ok(row.get(0))
    }

    pub async fn has_schema(&self, name: &str) -> Result<bool> {
        self.exists(queries::HAS_SCHEMA, &[&name]).await
    }

    /// `schema.table` checks one schema; a bare name searches every schema,
    /// not just the search path. Only regular tables count.
    pub async fn has_table(&self, name: &str) -> Result<bool> {
        match name.split_once('.') {
            Some((schema, table)) => {
                self.exists(queries::HAS_TABLE_IN_SCHEMA, &[&table, &schema])
                    .await
            }
            None => self.exists(queries::HAS_TABLE_ANY_SCHEMA, &[&name]).await,
        }
    }

    /// Installed, as opposed to [`is_extension_available`](Self::is_extension_available)
    pub async fn has_extension(&self, name: &str) -> Result<bool> {
        self.exists(queries::HAS_EXTENSION, &[&name]).await
    }

    /// The server ships this extension. It may still fail to install.
    pub async fn is_extension_available(&self, name: &str) -> Result<bool> {
        self.exists(queries::EXTENSION_AVAILABLE, &[&name]).await
    }

    /// Install an extension. Dependencies are not installed for you.
    ///
    /// Returns `false` only when `if_available` is set and the server doesn't
    /// have the extension.
    pub async fn install_extension(&self, name: &str, options: InstallOptions) -> Result<bool> {
        if options.if_available && !self.is_extension_available(name).await? {
            debug!(extension = name, "Extension not available, skipping install");
            return Ok(false);
        }

        let sql = SqlBuilder::create_extension(name, options.exists_ok, options.schema.as_deref());
        self.conn.batch_execute(&sql).await?;

        info!(extension = name, "Extension installed");
        Ok(true)
    }

    /// Create several schemas in one batch
    pub async fn create_schema<S: AsRef<str>>(&self, names: &[S], exists_ok: bool) -> Result<()> {
        let batch = SqlBuilder::batch(
            names
                .iter()
                .map(|name| SqlBuilder::create_schema(name.as_ref(), exists_ok)),
        );
        if let Some(batch) = batch {
            self.conn.batch_execute(&batch).await?;
        }
        Ok(())
    }

    /// Run a SQL file as one batch. Frozen time applies to its statements.
    pub async fn run_sql_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let sql = tokio::fs::read_to_string(path).await?;

        debug!(path = %path.display(), "Running SQL file");
        self.conn.batch_execute(&sql).await?;
        Ok(())
    }

    /// Run a single-statement SQL file with bound parameters (`$1`, `$2`, ...)
    /// and return the rows it produced. Frozen time applies here too.
    pub async fn run_sql_file_with_params(
        &self,
        path: impl AsRef<Path>,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let path = path.as_ref();
        let sql = tokio::fs::read_to_string(path).await?;
        // a prepared statement takes one command, so drop the trailing terminator
        let statement = sql.trim_end().trim_end_matches(';');

        debug!(path = %path.display(), params = params.len(), "Running SQL file");
        Ok(self.conn.query(statement, params).await?)
    }

    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        self.conn.batch_execute(sql).await?;
        Ok(())
    }
}

/// Behavior common to both fixture flavors
#[allow(async_fn_in_trait)]
pub trait TestDatabase: Sized {
    fn core(&self) -> &DatabaseCore;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Return the database to a clean state; the fixture stays usable
    async fn reset(&mut self) -> Result<()>;

    /// Final cleanup. The connection goes back to the pool afterwards.
    async fn teardown(self) -> Result<()>;

    async fn is_dirty(&self) -> Result<bool> {
        self.core().is_dirty().await
    }

    /// Run `body` with this fixture, then tear it down.
    ///
    /// Teardown runs whether the body returns normally or panics. A panic is
    /// resumed after teardown; a teardown error during a panic is logged.
    async fn scope<F, T>(mut self, body: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self) -> T,
    {
        let outcome = AssertUnwindSafe(body(&mut self)).catch_unwind().await;
        let teardown = self.teardown().await;

        match outcome {
            Ok(value) => teardown.map(|()| value),
            Err(panic) => {
                if let Err(err) = teardown {
                    warn!("Teardown failed while unwinding a panic: {}", err);
                }
                std::panic::resume_unwind(panic)
            }
        }
    }
}

impl std::fmt::Debug for DatabaseCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCore")
            .field("has_baseline", &self.baseline.is_some())
            .field("frozen", &self.time.is_frozen())
            .field("conn", &self.conn)
            .finish()
    }
}
