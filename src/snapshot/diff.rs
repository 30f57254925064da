//! Snapshot Diff Engine
//!
//! Compares a baseline snapshot with the current one and reports every
//! schema, table and extension that appeared or disappeared.

use crate::introspection::{Snapshot, TableInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Everything that differs between a baseline and the current state.
///
/// Tables are compared by full identity (schema, name and oid), so a renamed
/// table shows up once as missing and once as extra.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub extra_extensions: BTreeSet<String>,
    pub missing_extensions: BTreeSet<String>,
    pub extra_schemas: BTreeSet<String>,
    pub missing_schemas: BTreeSet<String>,
    pub extra_tables: BTreeSet<TableInfo>,
    pub missing_tables: BTreeSet<TableInfo>,
}

impl DriftReport {
    /// No drift in any category. `DriftDetector::is_dirty` answers the negation
    /// of this without building the report.
    pub fn is_clean(&self) -> bool {
        self.extra_extensions.is_empty()
            && self.missing_extensions.is_empty()
            && self.extra_schemas.is_empty()
            && self.missing_schemas.is_empty()
            && self.extra_tables.is_empty()
            && self.missing_tables.is_empty()
    }

    /// Something exists now that the baseline doesn't have
    pub fn has_extras(&self) -> bool {
        !self.extra_extensions.is_empty()
            || !self.extra_schemas.is_empty()
            || !self.extra_tables.is_empty()
    }
}

fn list<T: fmt::Display>(items: &BTreeSet<T>) -> String {
    if items.is_empty() {
        return "None".to_string();
    }
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "The database state wasn't reset successfully. Extra tables or schemas may \
             remain, or preexisting tables and/or schemas may not have been restored:"
        )?;
        writeln!(f, " * Extra extensions: {}", list(&self.extra_extensions))?;
        writeln!(f, " * Missing extensions: {}", list(&self.missing_extensions))?;
        writeln!(f, " * Extra schemas: {}", list(&self.extra_schemas))?;
        writeln!(f, " * Missing schemas: {}", list(&self.missing_schemas))?;
        writeln!(f, " * Extra tables: {}", list(&self.extra_tables))?;
        write!(f, " * Missing tables: {}", list(&self.missing_tables))
    }
}

/// The diff engine that compares snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare a baseline with the current snapshot
    pub fn diff(baseline: &Snapshot, current: &Snapshot) -> DriftReport {
        let old_tables: BTreeSet<TableInfo> = baseline.tables.iter().cloned().collect();
        let new_tables: BTreeSet<TableInfo> = current.tables.iter().cloned().collect();

        DriftReport {
            extra_extensions: current.extensions.difference(&baseline.extensions).cloned().collect(),
            missing_extensions: baseline.extensions.difference(&current.extensions).cloned().collect(),
            extra_schemas: current.schemas.difference(&baseline.schemas).cloned().collect(),
            missing_schemas: baseline.schemas.difference(&current.schemas).cloned().collect(),
            extra_tables: new_tables.difference(&old_tables).cloned().collect(),
            missing_tables: old_tables.difference(&new_tables).cloned().collect(),
        }
    }
}
