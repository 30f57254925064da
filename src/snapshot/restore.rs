//! Restore Engine
//!
//! Puts a database back into a state structurally equivalent to a baseline
//! snapshot. Steps run in dependency order:
//!
//! 1. drop extensions the baseline doesn't have
//! 2. materialize the current table state into a working schema
//! 3. fail if any baseline table was dropped (its oid is gone)
//! 4. undo renames and schema moves of baseline tables
//! 5. drop schemas the baseline doesn't have
//! 6. drop tables the baseline doesn't have
//! 7. drop the working schema and commit
//!
//! Step 4 must finish before step 5, otherwise a baseline table parked in a
//! new schema would be dropped along with it. Every step is written so that a
//! failed run leaves a state the next run converges from.
//!
//! The engine expects a connection with no open transaction; the database
//! fixtures roll back before calling it.

use crate::db::queries::{self, SqlBuilder, TEMP_NAME_PREFIX};
use crate::db::Executable;
use crate::error::{is_resource_exhaustion, HarnessError, Result};
use crate::introspection::{Snapshot, TableInfo};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What a restore run changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub dropped_extensions: Vec<String>,
    /// Baseline tables moved back to their original schema and name
    pub restored_tables: Vec<String>,
    /// Non-baseline relations renamed away from a baseline table's name
    pub evicted_relations: usize,
    pub dropped_schemas: Vec<String>,
    pub dropped_tables: Vec<String>,
}

impl RestoreSummary {
    pub fn is_noop(&self) -> bool {
        self.dropped_extensions.is_empty()
            && self.restored_tables.is_empty()
            && self.evicted_relations == 0
            && self.dropped_schemas.is_empty()
            && self.dropped_tables.is_empty()
    }
}

/// A baseline table whose current location differs from the baseline
#[derive(Debug, Clone)]
struct MovedTable {
    object_id: u32,
    orig_schema: String,
    orig_table: String,
    cur_schema: String,
    cur_table: String,
}

/// Phase-one name for a moved table
#[derive(Debug, Clone)]
struct RenamePlan {
    table: MovedTable,
    temp_name: String,
}

/// `_pgfixture_<oid>_<64 random bits>`. The oid alone is unique among live
/// tables; the suffix keeps it clear of anything a test named by hand.
pub(crate) fn temp_table_name(kind: &str, object_id: u32) -> String {
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}{}{}_{:016x}", TEMP_NAME_PREFIX, kind, object_id, suffix)
}

pub struct RestoreEngine<'a, E: ?Sized> {
    conn: &'a E,
    baseline: &'a Snapshot,
}

impl<'a, E> RestoreEngine<'a, E>
where
    E: Executable + ?Sized,
{
    /// Restore the database to `baseline`.
    ///
    /// Fails with [`HarnessError::NoSnapshot`] before touching anything when no
    /// baseline is given, and with [`HarnessError::TablesLost`] when a
    /// baseline table was dropped.
    pub async fn restore(conn: &'a E, baseline: Option<&'a Snapshot>) -> Result<RestoreSummary> {
        let baseline = baseline.ok_or(HarnessError::NoSnapshot)?;
        let engine = Self { conn, baseline };

        info!(checksum = %baseline.checksum(), "Restoring database to baseline snapshot");

        let mut summary = RestoreSummary {
            dropped_extensions: engine.drop_extra_extensions().await?,
            ..Default::default()
        };

        engine.materialize_current_state().await?;

        let moved = match engine.moved_tables().await {
            Ok(moved) => moved,
            Err(err) => {
                engine.discard_work_schema().await;
                return Err(err);
            }
        };

        let (restored, evicted) = engine.undo_renames(&moved).await?;
        summary.restored_tables = restored;
        summary.evicted_relations = evicted;
        summary.dropped_schemas = engine.drop_extra_schemas().await?;
        summary.dropped_tables = engine.drop_extra_tables().await?;

        conn.batch_execute(queries::CLEANUP_WORK_SCHEMA).await?;

        info!(
            "Restore complete: {} extensions, {} schemas, {} tables dropped; {} tables moved back",
            summary.dropped_extensions.len(),
            summary.dropped_schemas.len(),
            summary.dropped_tables.len(),
            summary.restored_tables.len()
        );

        Ok(summary)
    }

    async fn drop_extra_extensions(&self) -> Result<Vec<String>> {
        let baseline = self.baseline.extension_names();
        let rows = self
            .conn
            .query(queries::EXTRA_EXTENSIONS, &[&baseline])
            .await?;
        let extensions: Vec<String> = rows.iter().map(|r| r.get("extname")).collect();

        if let Some(batch) = SqlBuilder::batch(extensions.iter().map(|e| SqlBuilder::drop_extension(e))) {
            debug!(?extensions, "Dropping extensions");
            self.conn.batch_execute(&batch).await?;
        }

        Ok(extensions)
    }

    async fn materialize_current_state(&self) -> Result<()> {
        self.conn.batch_execute(queries::PREPARE_WORK_SCHEMA).await?;

        let schemas: Vec<&str> = self.baseline.tables.iter().map(|t| t.schema_name.as_str()).collect();
        let names: Vec<&str> = self.baseline.tables.iter().map(|t| t.table_name.as_str()).collect();
        let oids = self.baseline.table_oids();

        self.conn
            .query(queries::LOAD_ORIGINAL_TABLES, &[&schemas, &names, &oids])
            .await?;
        Ok(())
    }

    /// Baseline tables that are no longer where the baseline put them.
    /// Any table whose oid is gone aborts the restore.
    async fn moved_tables(&self) -> Result<Vec<MovedTable>> {
        let rows = self.conn.query(queries::MOVED_TABLES, &[]).await?;

        let mut moved = Vec::new();
        let mut lost = Vec::new();
        for row in rows {
            let object_id: u32 = row.get("object_id");
            let orig_schema: String = row.get("orig_schema");
            let orig_table: String = row.get("orig_table");
            let cur_schema: Option<String> = row.get("cur_schema");
            let cur_table: Option<String> = row.get("cur_table");

            match (cur_schema, cur_table) {
                (Some(cur_schema), Some(cur_table)) => moved.push(MovedTable {
                    object_id,
                    orig_schema,
                    orig_table,
                    cur_schema,
                    cur_table,
                }),
                _ => lost.push(TableInfo::new(orig_schema, orig_table, object_id)),
            }
        }

        if !lost.is_empty() {
            warn!(count = lost.len(), "Baseline tables were dropped and can't be restored");
            return Err(HarnessError::TablesLost(lost));
        }

        Ok(moved)
    }

    /// Two-phase rename. Swapped names would collide with a direct rename, so
    /// every moved table first gets a unique temporary name, then each one is
    /// moved to its original schema and renamed back.
    async fn undo_renames(&self, moved: &[MovedTable]) -> Result<(Vec<String>, usize)> {
        if moved.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let plans: Vec<RenamePlan> = moved
            .iter()
            .map(|t| RenamePlan {
                table: t.clone(),
                temp_name: temp_table_name("", t.object_id),
            })
            .collect();

        let phase_one = SqlBuilder::batch(plans.iter().map(|p| {
            SqlBuilder::rename_table(&p.table.cur_schema, &p.table.cur_table, &p.temp_name)
        }));
        if let Some(batch) = phase_one {
            debug!(count = plans.len(), "Renaming moved tables to temporary names");
            self.conn.batch_execute(&batch).await?;
        }

        let evicted = self.evict_squatters(&plans).await?;

        let phase_two = SqlBuilder::batch(plans.iter().flat_map(|p| {
            let t = &p.table;
            let mut statements = Vec::with_capacity(3);
            if t.cur_schema != t.orig_schema {
                statements.push(SqlBuilder::create_schema(&t.orig_schema, true));
                statements.push(SqlBuilder::set_schema(&t.cur_schema, &p.temp_name, &t.orig_schema));
            }
            statements.push(SqlBuilder::rename_table(&t.orig_schema, &p.temp_name, &t.orig_table));
            statements
        }));
        if let Some(batch) = phase_two {
            self.conn.batch_execute(&batch).await?;
        }

        let restored = plans
            .iter()
            .map(|p| {
                debug!(
                    oid = p.table.object_id,
                    "Moved {}.{} back to {}.{}",
                    p.table.cur_schema,
                    p.table.cur_table,
                    p.table.orig_schema,
                    p.table.orig_table
                );
                format!("{}.{}", p.table.orig_schema, p.table.orig_table)
            })
            .collect();

        Ok((restored, evicted))
    }

    /// A relation the test created under a baseline table's original name would
    /// block phase two. Rename it out of the way. Step 6 drops evicted tables;
    /// views, sequences and other relations are left under the evicted name.
    async fn evict_squatters(&self, plans: &[RenamePlan]) -> Result<usize> {
        let schemas: Vec<&str> = plans.iter().map(|p| p.table.orig_schema.as_str()).collect();
        let names: Vec<&str> = plans.iter().map(|p| p.table.orig_table.as_str()).collect();
        let oids = self.baseline.table_oids();

        let rows = self
            .conn
            .query(queries::SQUATTING_RELATIONS, &[&schemas, &names, &oids])
            .await?;

        let renames: Vec<String> = rows
            .iter()
            .map(|row| {
                let object_id: u32 = row.get("object_id");
                let relkind: String = row.get("relkind");
                let schema: String = row.get("schema_name");
                let table: String = row.get("table_name");
                warn!(
                    oid = object_id,
                    relkind = relkind.as_str(),
                    "Evicting {}.{} from a baseline table's name",
                    schema,
                    table
                );
                SqlBuilder::rename_relation(&relkind, &schema, &table, &temp_table_name("evicted_", object_id))
            })
            .collect();

        let count = renames.len();
        if let Some(batch) = SqlBuilder::batch(renames) {
            self.conn.batch_execute(&batch).await?;
        }
        Ok(count)
    }

    async fn drop_extra_schemas(&self) -> Result<Vec<String>> {
        let baseline = self.baseline.schema_names();
        let rows = self.conn.query(queries::EXTRA_SCHEMAS, &[&baseline]).await?;
        let schemas: Vec<String> = rows.iter().map(|r| r.get("nspname")).collect();

        for schema in &schemas {
            debug!(schema = schema.as_str(), "Dropping schema");
            match self.conn.batch_execute(&SqlBuilder::drop_schema(schema)).await {
                Ok(()) => {}
                Err(err) if err.as_db_error().is_some() => {
                    warn!(
                        schema = schema.as_str(),
                        resource_exhaustion = is_resource_exhaustion(&err),
                        "Cascading schema drop failed, dropping its tables one by one: {}",
                        err
                    );
                    self.recover().await?;
                    self.drop_schema_tables(schema).await?;
                    self.conn.batch_execute(&SqlBuilder::drop_schema(schema)).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(schemas)
    }

    async fn drop_schema_tables(&self, schema: &str) -> Result<()> {
        let rows = self.conn.query(queries::SCHEMA_TABLES, &[&schema]).await?;
        for row in rows {
            let table: String = row.get("table_name");
            self.conn
                .batch_execute(&SqlBuilder::drop_table(schema, &table))
                .await?;
        }
        Ok(())
    }

    async fn drop_extra_tables(&self) -> Result<Vec<String>> {
        let oids = self.baseline.table_oids();
        let rows = self.conn.query(queries::EXTRA_TABLES, &[&oids]).await?;
        let tables: Vec<(String, String)> = rows
            .iter()
            .map(|r| (r.get("schema_name"), r.get("table_name")))
            .collect();

        let batch = SqlBuilder::batch(tables.iter().map(|(s, t)| SqlBuilder::drop_table(s, t)));
        if let Some(batch) = batch {
            debug!(count = tables.len(), "Dropping tables");
            if let Err(err) = self.conn.batch_execute(&batch).await {
                if err.as_db_error().is_none() {
                    return Err(err.into());
                }
                warn!("Batched table drop failed, retrying one by one: {}", err);
                self.recover().await?;
                for (schema, table) in &tables {
                    self.conn
                        .batch_execute(&SqlBuilder::drop_table(schema, table))
                        .await?;
                }
            }
        }

        Ok(tables.into_iter().map(|(s, t)| format!("{}.{}", s, t)).collect())
    }

    /// Clear an aborted transaction so the connection accepts statements again
    async fn recover(&self) -> Result<()> {
        self.conn.batch_execute("ROLLBACK").await?;
        Ok(())
    }

    async fn discard_work_schema(&self) {
        if let Err(err) = self.conn.batch_execute(queries::CLEANUP_WORK_SCHEMA).await {
            warn!("Failed to drop the restore working schema: {}", err);
        }
    }
}
