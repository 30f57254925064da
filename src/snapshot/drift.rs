//! Drift detection
//!
//! The cheap question ("does the catalog still match?") is answered by one
//! boolean query. The full report needs a second snapshot and is only built
//! when a caller wants to explain the drift.

use crate::db::queries;
use crate::db::Executable;
use crate::error::Result;
use crate::introspection::{Snapshot, SnapshotService};
use crate::snapshot::diff::{DiffEngine, DriftReport};
use tracing::debug;

pub struct DriftDetector;

impl DriftDetector {
    /// False iff a fresh snapshot would equal the baseline. Extra, missing,
    /// renamed and moved objects all count.
    pub async fn is_dirty<E>(conn: &E, baseline: &Snapshot) -> Result<bool>
    where
        E: Executable + ?Sized,
    {
        let schemas = baseline.schema_names();
        let oids = baseline.table_oids();
        let extensions = baseline.extension_names();
        let table_schemas: Vec<&str> = baseline.tables.iter().map(|t| t.schema_name.as_str()).collect();
        let table_names: Vec<&str> = baseline.tables.iter().map(|t| t.table_name.as_str()).collect();

        let row = conn
            .query_one(
                queries::IS_DIRTY,
                &[&schemas, &oids, &extensions, &table_schemas, &table_names],
            )
            .await?;
        let dirty: bool = row.get("dirty");

        debug!(dirty, "Drift check complete");
        Ok(dirty)
    }

    /// Capture the current state and diff it against the baseline
    pub async fn report<E>(conn: &E, baseline: &Snapshot) -> Result<DriftReport>
    where
        E: Executable + ?Sized,
    {
        let current = SnapshotService::capture(conn).await?;
        Ok(DiffEngine::diff(baseline, &current))
    }
}
