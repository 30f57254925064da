//! Database access layer
//!
//! Handles connection pooling and the `Executable` capability every
//! snapshot, drift and restore operation is written against.

pub mod queries;

use crate::config::DatabaseConfig;
use crate::error::{HarnessError, Result};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::debug;

/// Anything that can run SQL text: a client, a transaction, a pooled object
/// or a [`TestConnection`](crate::connection::TestConnection).
#[allow(async_fn_in_trait)]
pub trait Executable {
    /// Run one statement with bound parameters and collect the rows
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error>;

    /// Run one statement that must return exactly one row
    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, tokio_postgres::Error>;

    /// Run one or more `;`-separated statements without parameters
    async fn batch_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error>;
}

impl Executable for tokio_postgres::Client {
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        tokio_postgres::Client::query(self, sql, params).await
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, tokio_postgres::Error> {
        tokio_postgres::Client::query_one(self, sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        tokio_postgres::Client::batch_execute(self, sql).await
    }
}

impl Executable for tokio_postgres::Transaction<'_> {
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        tokio_postgres::Transaction::query(self, sql, params).await
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, tokio_postgres::Error> {
        tokio_postgres::Transaction::query_one(self, sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        tokio_postgres::Transaction::batch_execute(self, sql).await
    }
}

impl Executable for deadpool_postgres::Object {
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        let client: &tokio_postgres::Client = self;
        client.query(sql, params).await
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, tokio_postgres::Error> {
        let client: &tokio_postgres::Client = self;
        client.query_one(sql, params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        let client: &tokio_postgres::Client = self;
        client.batch_execute(sql).await
    }
}

/// Create a connection pool for the given configuration.
///
/// Connections are recycled with `DISCARD ALL`, which fails inside an open
/// transaction, so a connection abandoned mid-transaction is thrown away
/// instead of being handed to the next fixture.
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = Some(config.password.clone());
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Clean,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    debug!("Creating pool for {}", config.to_display_string());

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| HarnessError::Config(crate::config::ConfigError::InvalidValue(format!(
            "Failed to create pool: {}",
            e
        ))))
}
