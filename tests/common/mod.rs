//! Shared setup for tests that need a live PostgreSQL server.
//!
//! Every test here works on schemas prefixed `pgfx_`. Leftovers from an
//! aborted earlier run are dropped before the harness captures its baseline.

#![allow(dead_code)]

use once_cell::sync::Lazy;
use pg_fixture::{HarnessSettings, PostgresTestDb, Snapshot, SnapshotService, TestConnection, TestHarness};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// Tests in one binary share the database; restores must not overlap.
static DATABASE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const SOURCE_SCHEMA: &str = "pgfx_src";

pub struct LiveDatabase {
    pub harness: TestHarness,
    _lock: MutexGuard<'static, ()>,
}

/// `None` (and a note on stderr) when no test database is configured
pub async fn live_database() -> anyhow::Result<Option<LiveDatabase>> {
    pg_fixture::init_tracing();

    let settings = match HarnessSettings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Skipping database test: {}", e);
            return Ok(None);
        }
    };

    let lock = DATABASE_LOCK.lock().await;
    drop_test_schemas(&settings.url).await?;

    let harness = TestHarness::init(settings).await?;
    Ok(Some(LiveDatabase {
        harness,
        _lock: lock,
    }))
}

async fn drop_test_schemas(url: &str) -> anyhow::Result<()> {
    let conn = TestConnection::connect(url).await?;
    let rows = conn
        .client()
        .query(
            "SELECT nspname::text FROM pg_catalog.pg_namespace WHERE nspname LIKE 'pgfx\\_%' OR nspname = '_pgfixture'",
            &[],
        )
        .await?;

    for row in rows {
        let schema: String = row.get(0);
        conn.client()
            .batch_execute(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema))
            .await?;
    }
    Ok(())
}

impl LiveDatabase {
    /// A full-reset fixture whose baseline includes `pgfx_src.alpha` and
    /// `pgfx_src.beta`, committed before the snapshot is taken.
    pub async fn seeded(&self) -> anyhow::Result<(PostgresTestDb, Arc<Snapshot>)> {
        let conn = TestConnection::from_pool(self.harness.pool()).await?;
        conn.client()
            .batch_execute(&format!(
                "CREATE SCHEMA {s};
                 CREATE TABLE {s}.alpha (id int PRIMARY KEY, label text);
                 CREATE TABLE {s}.beta (id int PRIMARY KEY, alpha_id int REFERENCES {s}.alpha (id));
                 INSERT INTO {s}.alpha VALUES (1, 'one');",
                s = SOURCE_SCHEMA
            ))
            .await?;

        let baseline = Arc::new(SnapshotService::capture(&conn).await?);
        let db = PostgresTestDb::new(self.harness.settings().url.clone(), conn, Some(Arc::clone(&baseline)));
        Ok((db, baseline))
    }

    /// Restore to the harness baseline, removing whatever a test seeded
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let conn = TestConnection::from_pool(self.harness.pool()).await?;
        let db = PostgresTestDb::new(
            self.harness.settings().url.clone(),
            conn,
            Some(self.harness.baseline()),
        );
        db.restore_to_snapshot().await?;
        Ok(())
    }
}
