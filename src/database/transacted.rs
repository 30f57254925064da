//! Transaction-scoped fixture
//!
//! Everything a test does happens inside a transaction opened by the fixture.
//! Reset rolls it back and opens the next one. If the database still differs
//! from the baseline afterwards, something committed behind the fixture's back
//! and reset fails with the full drift report instead of repairing it.

use super::{DatabaseCore, TestDatabase};
use crate::connection::TestConnection;
use crate::error::{HarnessError, Result};
use crate::introspection::Snapshot;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct TransactedPostgresTestDb {
    core: DatabaseCore,
    /// Number of the transaction currently open, `None` after teardown
    transaction: Option<u64>,
}

impl TransactedPostgresTestDb {
    /// Opens the first transaction
    pub async fn new(
        url: impl Into<String>,
        conn: TestConnection,
        baseline: Option<Arc<Snapshot>>,
    ) -> Result<Self> {
        let core = DatabaseCore::new(url, conn, baseline);
        core.execute_raw("BEGIN").await?;
        debug!(transaction = 1, "Transaction opened");

        Ok(Self {
            core,
            transaction: Some(1),
        })
    }

    /// Number of the open transaction; it goes up by one at every reset
    pub fn transaction(&self) -> Option<u64> {
        self.transaction
    }

    async fn rollback_only(&mut self) -> Result<()> {
        self.core.execute_raw("ROLLBACK").await?;
        if let Some(tx) = self.transaction.take() {
            debug!(transaction = tx, "Transaction rolled back");
        }
        Ok(())
    }

    async fn begin_next(&mut self, previous: u64) -> Result<()> {
        self.core.execute_raw("BEGIN").await?;
        self.transaction = Some(previous + 1);
        debug!(transaction = previous + 1, "Transaction opened");
        Ok(())
    }

    /// Drift left behind after a rollback means a commit got through
    async fn check_clean(&self) -> Result<()> {
        if self.core.baseline().is_none() {
            return Ok(());
        }
        if !self.core.is_dirty().await? {
            return Ok(());
        }

        let report = self.core.drift_report().await?;
        warn!("Database is dirty after rollback:\n{}", report);
        Err(HarnessError::DirtyState(Box::new(report)))
    }
}

impl Deref for TransactedPostgresTestDb {
    type Target = DatabaseCore;

    fn deref(&self) -> &DatabaseCore {
        &self.core
    }
}

impl TestDatabase for TransactedPostgresTestDb {
    fn core(&self) -> &DatabaseCore {
        &self.core
    }

    /// Roll back and open the next transaction
    async fn rollback(&mut self) -> Result<()> {
        let previous = self.transaction.unwrap_or(0);
        self.rollback_only().await?;
        self.begin_next(previous).await
    }

    /// The next transaction is open even when this fails with
    /// [`HarnessError::DirtyState`].
    async fn reset(&mut self) -> Result<()> {
        self.core.time().unfreeze();
        self.rollback().await?;
        self.check_clean().await
    }

    async fn teardown(mut self) -> Result<()> {
        self.core.time().unfreeze();
        self.rollback_only().await?;
        self.check_clean().await
    }
}
