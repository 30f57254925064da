//! Catalog Introspection Module
//!
//! Captures the structural baseline of a database: which schemas exist, which
//! tables exist (by oid), and which extensions are installed.

use crate::db::queries;
use crate::db::Executable;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// A table identified by its oid. The oid survives renames and schema moves;
/// the name pair is only the table's location at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub schema_name: String,
    pub table_name: String,
    pub object_id: u32,
}

impl TableInfo {
    pub fn new(schema_name: impl Into<String>, table_name: impl Into<String>, object_id: u32) -> Self {
        Self {
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            object_id,
        }
    }
}

impl fmt::Display for TableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema_name, self.table_name)
    }
}

/// Structural state of a database at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub schemas: BTreeSet<String>,
    /// Ordered by schema, then table name
    pub tables: Vec<TableInfo>,
    pub extensions: BTreeSet<String>,
}

impl Snapshot {
    pub fn new<S, E>(schemas: S, mut tables: Vec<TableInfo>, extensions: E) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        sort_by_location(&mut tables);
        Self {
            schemas: schemas.into_iter().map(Into::into).collect(),
            tables,
            extensions: extensions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn schema_names(&self) -> Vec<String> {
        self.schemas.iter().cloned().collect()
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.iter().cloned().collect()
    }

    pub fn table_oids(&self) -> Vec<u32> {
        self.tables.iter().map(|t| t.object_id).collect()
    }

    /// Find a table by its captured location
    pub fn table(&self, schema: &str, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.schema_name == schema && t.table_name == name)
    }

    /// Compute checksum from snapshot content
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();

        for schema in &self.schemas {
            hasher.update(format!("S:{}\n", schema).as_bytes());
        }

        let mut tables: Vec<&TableInfo> = self.tables.iter().collect();
        tables.sort();
        for table in tables {
            hasher.update(
                format!("T:{}.{}:{}\n", table.schema_name, table.table_name, table.object_id)
                    .as_bytes(),
            );
        }

        for ext in &self.extensions {
            hasher.update(format!("E:{}\n", ext).as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

fn sort_by_location(tables: &mut [TableInfo]) {
    tables.sort_by(|a, b| (&a.schema_name, &a.table_name).cmp(&(&b.schema_name, &b.table_name)));
}

/// Reads snapshots out of the PostgreSQL catalog
pub struct SnapshotService;

impl SnapshotService {
    /// Capture the current schemas, tables and extensions.
    ///
    /// All three come from one statement, so they are consistent with each
    /// other even if DDL runs concurrently on another session.
    pub async fn capture<E>(conn: &E) -> Result<Snapshot>
    where
        E: Executable + ?Sized,
    {
        let rows = conn.query(queries::CAPTURE_SNAPSHOT, &[]).await?;

        let mut snapshot = Snapshot::default();
        for row in rows {
            let kind: &str = row.get("kind");
            let name: String = row.get("name");
            match kind {
                "schema" => {
                    snapshot.schemas.insert(name);
                }
                "table" => snapshot.tables.push(TableInfo {
                    schema_name: row.get("schema_name"),
                    table_name: name,
                    object_id: row.get("object_id"),
                }),
                "extension" => {
                    snapshot.extensions.insert(name);
                }
                other => warn!("Ignoring unknown catalog row kind {:?}", other),
            }
        }

        sort_by_location(&mut snapshot.tables);

        debug!(
            "Captured snapshot with {} schemas, {} tables, {} extensions",
            snapshot.schemas.len(),
            snapshot.tables.len(),
            snapshot.extensions.len()
        );

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot::new(
            ["public", "billing"],
            vec![
                TableInfo::new("public", "users", 16384),
                TableInfo::new("billing", "invoices", 16390),
            ],
            ["plpgsql"],
        )
    }

    #[test]
    fn test_tables_are_ordered_by_location() {
        let snapshot = sample();
        assert_eq!(snapshot.tables[0].to_string(), "billing.invoices");
        assert_eq!(snapshot.tables[1].to_string(), "public.users");
        assert_eq!(snapshot.table_oids(), vec![16390, 16384]);
    }

    #[test]
    fn test_checksum_consistency() {
        let checksum1 = sample().checksum();
        let checksum2 = sample().checksum();
        assert_eq!(checksum1, checksum2);
        assert_eq!(checksum1.len(), 64);
    }

    #[test]
    fn test_checksum_tracks_identity() {
        let mut renamed = sample();
        renamed.tables[1].table_name = "accounts".to_string();
        assert_ne!(sample().checksum(), renamed.checksum());

        let mut recreated = sample();
        recreated.tables[1].object_id = 17000;
        assert_ne!(sample().checksum(), recreated.checksum());
    }

    #[test]
    fn test_table_lookup() {
        let snapshot = sample();
        assert_eq!(snapshot.table("public", "users").map(|t| t.object_id), Some(16384));
        assert!(snapshot.table("public", "invoices").is_none());
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["tables"][0]["objectId"], 16390);
        assert_eq!(json["extensions"][0], "plpgsql");
    }
}
