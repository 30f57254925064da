//! pg-fixture - isolated, reproducible PostgreSQL databases for tests
//!
//! A [`TestHarness`] captures a baseline snapshot of the test database once.
//! Each test then gets a fixture:
//! - [`PostgresTestDb`] runs the test on a plain connection and, on reset,
//!   restores the baseline if the test left anything behind (new schemas,
//!   tables or extensions, renamed or moved tables).
//! - [`TransactedPostgresTestDb`] wraps the test in a transaction and rolls it
//!   back, failing loudly if something committed anyway.
//!
//! Both fixtures can freeze time: `NOW()`, `CURRENT_DATE` and friends are
//! rewritten to a fixed instant on the fixture's connection.
//!
//! ```ignore
//! let harness = TestHarness::from_env().await?;
//! harness
//!     .transacted_database()
//!     .await?
//!     .scope(async |db| {
//!         let _frozen = db.time().freeze("2017-01-01", FreezeOptions::default())?;
//!         db.connection().batch_execute("CREATE TABLE t (at timestamptz DEFAULT NOW())").await?;
//!         Ok::<_, HarnessError>(())
//!     })
//!     .await??;
//! ```

pub mod config;
pub mod connection;
pub mod database;
pub mod db;
pub mod error;
pub mod harness;
pub mod introspection;
pub mod snapshot;
pub mod time;

pub use config::{ConfigError, DatabaseConfig, HarnessSettings};
pub use connection::{HookId, HookRegistry, StatementHook, TestConnection};
pub use database::{DatabaseCore, InstallOptions, PostgresTestDb, TestDatabase, TransactedPostgresTestDb};
pub use db::Executable;
pub use error::{HarnessError, Result};
pub use harness::TestHarness;
pub use introspection::{Snapshot, SnapshotService, TableInfo};
pub use snapshot::{DiffEngine, DriftDetector, DriftReport, RestoreEngine, RestoreSummary};
pub use time::{FreezeGuard, FreezeOptions, FrozenClock, IntoFrozenInstant, TimeFreezer};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a tracing subscriber for test binaries, filtered by `RUST_LOG`.
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,pg_fixture=info"));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_test_writer()
                .compact(),
        )
        .try_init();
}
