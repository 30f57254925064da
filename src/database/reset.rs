//! Full-reset fixture
//!
//! For tests that can't live inside one transaction: they may commit, create
//! schemas, rename tables. Reset rolls back whatever is still open and, if the
//! database drifted from the baseline, runs the restore engine.

use super::{DatabaseCore, TestDatabase};
use crate::connection::TestConnection;
use crate::error::Result;
use crate::introspection::Snapshot;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct PostgresTestDb {
    core: DatabaseCore,
}

impl PostgresTestDb {
    /// Without a baseline, reset can only roll back.
    pub fn new(url: impl Into<String>, conn: TestConnection, baseline: Option<Arc<Snapshot>>) -> Self {
        Self {
            core: DatabaseCore::new(url, conn, baseline),
        }
    }
}

impl Deref for PostgresTestDb {
    type Target = DatabaseCore;

    fn deref(&self) -> &DatabaseCore {
        &self.core
    }
}

impl TestDatabase for PostgresTestDb {
    fn core(&self) -> &DatabaseCore {
        &self.core
    }

    async fn rollback(&mut self) -> Result<()> {
        self.core.execute_raw("ROLLBACK").await
    }

    async fn reset(&mut self) -> Result<()> {
        self.core.time().unfreeze();
        self.rollback().await?;

        if self.core.baseline().is_none() {
            debug!("No baseline snapshot, reset is rollback only");
            return Ok(());
        }

        if self.core.is_dirty().await? {
            let summary = self.core.restore_to_snapshot().await?;
            info!(
                restored = summary.restored_tables.len(),
                dropped_tables = summary.dropped_tables.len(),
                "Database restored after test"
            );
        }
        Ok(())
    }

    async fn teardown(mut self) -> Result<()> {
        self.reset().await
    }
}
