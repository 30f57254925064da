//! Error handling module
//!
//! Provides unified error types for snapshots, restores and fixtures.

use crate::config::ConfigError;
use crate::introspection::TableInfo;
use crate::snapshot::DriftReport;
use thiserror::Error;

/// Harness-wide error type
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Restore was requested but the fixture was built without a baseline.
    #[error("Can't restore the database: no snapshot was given to the fixture")]
    NoSnapshot,

    /// Baseline tables whose oid no longer exists. Structure alone can't bring them back.
    #[error("Can't restore dropped table(s): {}", join_tables(.0))]
    TablesLost(Vec<TableInfo>),

    /// A rollback did not erase all drift, so something committed behind the fixture's back.
    #[error("{0}")]
    DirtyState(Box<DriftReport>),

    #[error("Invalid freeze instant: {0}")]
    InvalidInstant(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    /// The drift report carried by a dirty-state error, if any
    pub fn drift_report(&self) -> Option<&DriftReport> {
        match self {
            HarnessError::DirtyState(report) => Some(report.as_ref()),
            _ => None,
        }
    }

    /// True for server-side failures that a simpler retry might get past
    /// (out of memory, too many locks, statement too complex, ...).
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            HarnessError::Database(e) => is_resource_exhaustion(e),
            _ => false,
        }
    }
}

/// Class 53 (insufficient resources) and class 54 (program limit exceeded).
pub(crate) fn is_resource_exhaustion(err: &tokio_postgres::Error) -> bool {
    err.code()
        .map(|state| {
            let code = state.code();
            code.starts_with("53") || code.starts_with("54")
        })
        .unwrap_or(false)
}

fn join_tables(tables: &[TableInfo]) -> String {
    tables
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias used across the crate
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_lost_names_every_table() {
        let err = HarnessError::TablesLost(vec![
            TableInfo::new("public", "users", 16384),
            TableInfo::new("billing", "invoices", 16390),
        ]);

        assert_eq!(
            err.to_string(),
            "Can't restore dropped table(s): public.users, billing.invoices"
        );
    }

    #[test]
    fn test_dirty_state_carries_report() {
        let mut report = DriftReport::default();
        report.extra_schemas.insert("scratch".to_string());

        let err = HarnessError::DirtyState(Box::new(report.clone()));

        assert_eq!(err.drift_report(), Some(&report));
        assert!(err.to_string().starts_with("The database state wasn't reset successfully."));
        assert!(err.to_string().contains(" * Extra schemas: scratch\n"));
    }

    #[test]
    fn test_no_snapshot_message() {
        let err = HarnessError::NoSnapshot;
        assert!(err.to_string().contains("no snapshot"));
        assert!(!err.is_resource_exhaustion());
        assert!(err.drift_report().is_none());
    }
}
