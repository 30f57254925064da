//! Restore engine against a live server.
//!
//! Run with `PG_FIXTURE_DATABASE_URL=postgres://... cargo test`; without it
//! these tests return early.

mod common;

use common::{live_database, SOURCE_SCHEMA};
use pg_fixture::{
    Executable, HarnessError, InstallOptions, PostgresTestDb, SnapshotService, TestConnection, TestDatabase,
    TestHarness,
};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_restore_round_trip() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, baseline) = live.seeded().await?;
    assert!(!db.is_dirty().await?);

    db.connection()
        .batch_execute(
            "CREATE SCHEMA pgfx_new;
             CREATE TABLE pgfx_new.scratch (id int);
             ALTER TABLE pgfx_src.alpha SET SCHEMA pgfx_new;
             ALTER TABLE pgfx_src.beta RENAME TO beta_renamed;
             CREATE TABLE pgfx_src.extra (id int);",
        )
        .await?;
    db.install_extension(
        "pgcrypto",
        InstallOptions {
            if_available: true,
            exists_ok: true,
            schema: None,
        },
    )
    .await?;

    assert!(db.is_dirty().await?);

    let summary = db.restore_to_snapshot().await?;
    assert_eq!(
        summary.restored_tables,
        vec!["pgfx_src.alpha".to_string(), "pgfx_src.beta".to_string()]
    );
    assert_eq!(summary.dropped_schemas, vec!["pgfx_new".to_string()]);
    assert!(summary.dropped_tables.contains(&"pgfx_src.extra".to_string()));

    let after = SnapshotService::capture(db.connection()).await?;
    assert_eq!(after, *baseline);
    assert!(!db.is_dirty().await?);

    // Data survives the round trip because the tables were moved, not recreated
    let row = db
        .connection()
        .query_one("SELECT label FROM pgfx_src.alpha WHERE id = 1", &[])
        .await?;
    assert_eq!(row.get::<_, String>(0), "one");

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_swapped_names() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, baseline) = live.seeded().await?;

    db.connection()
        .batch_execute(
            "ALTER TABLE pgfx_src.alpha RENAME TO swap_tmp;
             ALTER TABLE pgfx_src.beta RENAME TO alpha;
             ALTER TABLE pgfx_src.swap_tmp RENAME TO beta;",
        )
        .await?;

    let summary = db.restore_to_snapshot().await?;
    assert_eq!(summary.restored_tables.len(), 2);
    assert_eq!(summary.evicted_relations, 0);

    let after = SnapshotService::capture(db.connection()).await?;
    for name in ["alpha", "beta"] {
        assert_eq!(
            after.table(SOURCE_SCHEMA, name).map(|t| t.object_id),
            baseline.table(SOURCE_SCHEMA, name).map(|t| t.object_id),
        );
    }

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_evicts_table_squatting_on_baseline_name() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, baseline) = live.seeded().await?;

    db.connection()
        .batch_execute(
            "ALTER TABLE pgfx_src.alpha RENAME TO alpha_old;
             CREATE TABLE pgfx_src.alpha (id int);",
        )
        .await?;

    let summary = db.restore_to_snapshot().await?;
    assert_eq!(summary.evicted_relations, 1);
    assert_eq!(summary.dropped_tables.len(), 1);

    let after = SnapshotService::capture(db.connection()).await?;
    assert_eq!(after, *baseline);

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_schema_rename() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, baseline) = live.seeded().await?;

    db.connection()
        .batch_execute("ALTER SCHEMA pgfx_src RENAME TO pgfx_moved")
        .await?;
    assert!(!db.has_schema(SOURCE_SCHEMA).await?);

    db.restore_to_snapshot().await?;

    assert!(db.has_schema(SOURCE_SCHEMA).await?);
    assert!(!db.has_schema("pgfx_moved").await?);
    assert_eq!(SnapshotService::capture(db.connection()).await?, *baseline);

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_fails_on_dropped_table() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, _baseline) = live.seeded().await?;

    db.connection().batch_execute("DROP TABLE pgfx_src.beta").await?;

    let err = tokio_test::assert_err!(db.restore_to_snapshot().await);
    match &err {
        HarnessError::TablesLost(tables) => {
            let names: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
            assert_eq!(names, vec!["pgfx_src.beta".to_string()]);
        }
        other => panic!("expected TablesLost, got {:?}", other),
    }
    assert_eq!(err.to_string(), "Can't restore dropped table(s): pgfx_src.beta");

    // The working schema doesn't outlive the failed run
    assert!(!db.has_schema("_pgfixture").await?);

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_without_baseline_changes_nothing() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let conn = TestConnection::from_pool(live.harness.pool()).await?;
    let mut db = PostgresTestDb::new(live.harness.settings().url.clone(), conn, None);

    db.create_schema(&["pgfx_nobase"], false).await?;

    assert!(matches!(db.restore_to_snapshot().await, Err(HarnessError::NoSnapshot)));
    assert!(matches!(db.is_dirty().await, Err(HarnessError::NoSnapshot)));
    assert!(db.has_schema("pgfx_nobase").await?);

    // Reset without a baseline is a rollback and nothing else
    db.reset().await?;
    assert!(db.has_schema("pgfx_nobase").await?);

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_reset_restores_only_when_dirty() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (mut db, baseline) = live.seeded().await?;

    db.reset().await?;
    assert_eq!(SnapshotService::capture(db.connection()).await?, *baseline);

    db.connection()
        .batch_execute("CREATE TABLE pgfx_src.leftover (id int)")
        .await?;
    db.reset().await?;
    assert!(!db.has_table("pgfx_src.leftover").await?);
    assert!(db.has_table("pgfx_src.alpha").await?);

    db.teardown().await?;
    live.cleanup().await
}

#[tokio::test]
async fn test_reset_restores_renamed_and_moved_tables() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (mut db, baseline) = live.seeded().await?;

    db.connection()
        .batch_execute(
            "ALTER TABLE pgfx_src.alpha RENAME TO alpha_renamed;
             ALTER TABLE pgfx_src.beta SET SCHEMA public;",
        )
        .await?;
    // Same oids, nothing extra: only the locations changed
    assert!(db.is_dirty().await?);

    db.reset().await?;
    assert_eq!(SnapshotService::capture(db.connection()).await?, *baseline);
    assert!(!db.is_dirty().await?);
    assert!(!db.has_table("public.beta").await?);

    db.teardown().await?;
    live.cleanup().await
}

#[tokio::test]
async fn test_reset_reports_dropped_baseline_table() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (mut db, _baseline) = live.seeded().await?;

    db.connection().batch_execute("DROP TABLE pgfx_src.beta").await?;
    assert!(db.is_dirty().await?);

    match db.reset().await {
        Err(HarnessError::TablesLost(tables)) => {
            let names: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
            assert_eq!(names, vec!["pgfx_src.beta".to_string()]);
        }
        other => panic!("expected TablesLost, got {:?}", other),
    }

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_restore_evicts_views_and_sequences_on_baseline_names() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let (db, baseline) = live.seeded().await?;

    db.connection()
        .batch_execute(
            "ALTER TABLE pgfx_src.alpha RENAME TO alpha_old;
             CREATE VIEW pgfx_src.alpha AS SELECT 1 AS id;
             ALTER TABLE pgfx_src.beta RENAME TO beta_old;
             CREATE SEQUENCE pgfx_src.beta;",
        )
        .await?;

    let summary = db.restore_to_snapshot().await?;
    assert_eq!(summary.evicted_relations, 2);
    assert_eq!(SnapshotService::capture(db.connection()).await?, *baseline);

    let row = db
        .connection()
        .query_one(
            "SELECT count(*) FROM pg_catalog.pg_class c
                JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = 'pgfx_src'
                AND c.relkind IN ('v', 'S')
                AND c.relname LIKE '\\_pgfixture\\_evicted\\_%'",
            &[],
        )
        .await?;
    assert_eq!(row.get::<_, i64>(0), 2);

    drop(db);
    live.cleanup().await
}

#[tokio::test]
async fn test_stale_work_schema_stays_out_of_baseline() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };

    // What a restore killed halfway leaves behind
    let conn = TestConnection::connect(&live.harness.settings().url).await?;
    conn.client()
        .batch_execute(
            "CREATE SCHEMA _pgfixture;
             CREATE TABLE _pgfixture.current_tables (schema_name text, table_name text, object_id oid);",
        )
        .await?;

    let harness = TestHarness::init(live.harness.settings().clone()).await?;
    let baseline = harness.baseline();
    assert!(!baseline.schemas.contains("_pgfixture"));
    assert!(baseline.tables.iter().all(|t| t.schema_name != "_pgfixture"));

    let mut db = harness.database().await?;
    assert!(!db.is_dirty().await?);
    db.create_schema(&["pgfx_stale"], false).await?;
    db.reset().await?;
    assert!(!db.has_schema("pgfx_stale").await?);
    assert!(!db.has_schema("_pgfixture").await?);

    drop(db);
    harness.teardown();
    Ok(())
}

#[tokio::test]
async fn test_missing_baseline_schema_is_dirty() -> anyhow::Result<()> {
    let Some(live) = live_database().await? else {
        return Ok(());
    };
    let conn = TestConnection::from_pool(live.harness.pool()).await?;
    conn.client().batch_execute("CREATE SCHEMA pgfx_empty").await?;
    drop(conn);

    let (db, _baseline) = live.seeded().await?;
    assert!(!db.is_dirty().await?);

    db.connection().batch_execute("DROP SCHEMA pgfx_empty").await?;
    assert!(db.is_dirty().await?);

    let report = db.drift_report().await?;
    assert!(!report.has_extras());
    assert_eq!(
        report.missing_schemas.iter().cloned().collect::<Vec<_>>(),
        vec!["pgfx_empty".to_string()]
    );

    drop(db);
    live.cleanup().await
}
