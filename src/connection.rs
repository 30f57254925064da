//! Test connection wrapper
//!
//! A single PostgreSQL session owned by one fixture. Every statement sent
//! through it passes the registered statement hooks first, which is how the
//! time layer rewrites `NOW()` and friends before they reach the server.

use crate::config::DatabaseConfig;
use crate::db::Executable;
use crate::error::Result;
use deadpool_postgres::Pool;
use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, trace, warn};

/// Rewrites statement text right before it is sent
pub trait StatementHook: Send + Sync {
    /// Return `Some(new_sql)` to replace the statement, `None` to leave it alone
    fn before_execute(&self, sql: &str) -> Option<String>;
}

/// Handle returned by [`HookRegistry::listen`], used to remove the hook again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

#[derive(Default)]
struct HookList {
    next_id: u64,
    hooks: Vec<(HookId, Arc<dyn StatementHook>)>,
}

/// Ordered set of statement hooks attached to one connection
#[derive(Clone, Default)]
pub struct HookRegistry {
    inner: Arc<Mutex<HookList>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HookList> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a hook; it runs after every hook registered before it
    pub fn listen(&self, hook: Arc<dyn StatementHook>) -> HookId {
        let mut list = self.lock();
        let id = HookId(list.next_id);
        list.next_id += 1;
        list.hooks.push((id, hook));
        id
    }

    /// Remove a hook. Returns false if it was already gone.
    pub fn remove(&self, id: HookId) -> bool {
        let mut list = self.lock();
        let before = list.hooks.len();
        list.hooks.retain(|(hook_id, _)| *hook_id != id);
        list.hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `sql` through every hook in registration order
    pub fn apply<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        // Snapshot the list so hooks run without the lock held
        let hooks: Vec<Arc<dyn StatementHook>> =
            self.lock().hooks.iter().map(|(_, h)| Arc::clone(h)).collect();

        let mut statement = Cow::Borrowed(sql);
        for hook in hooks {
            if let Some(rewritten) = hook.before_execute(&statement) {
                statement = Cow::Owned(rewritten);
            }
        }
        statement
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry").field("hooks", &self.len()).finish()
    }
}

enum ClientHandle {
    Pooled(deadpool_postgres::Object),
    Direct(Client),
}

impl ClientHandle {
    fn client(&self) -> &Client {
        match self {
            ClientHandle::Pooled(object) => {
                let client: &Client = object;
                client
            }
            ClientHandle::Direct(client) => client,
        }
    }
}

/// One hook-aware database session
pub struct TestConnection {
    handle: ClientHandle,
    hooks: HookRegistry,
}

impl TestConnection {
    /// Check a connection out of the shared pool
    pub async fn from_pool(pool: &Pool) -> Result<Self> {
        let object = pool.get().await?;
        Ok(Self {
            handle: ClientHandle::Pooled(object),
            hooks: HookRegistry::new(),
        })
    }

    /// Open a dedicated connection, outside of any pool
    pub async fn connect(url: &str) -> Result<Self> {
        let config = DatabaseConfig::from_url(url)?;
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("Connection error: {}", e);
            }
        });

        debug!("Opened test connection to {}", config.to_display_string());
        Ok(Self::from_client(client))
    }

    /// Wrap an already-connected client
    pub fn from_client(client: Client) -> Self {
        Self {
            handle: ClientHandle::Direct(client),
            hooks: HookRegistry::new(),
        }
    }

    /// Hooks applied to every statement sent through this connection
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// The raw client. Statements sent through it bypass the hooks.
    pub fn client(&self) -> &Client {
        self.handle.client()
    }

    /// Set `work_mem` for this session
    pub async fn set_work_mem(&self, megabytes: u32) -> Result<()> {
        self.client()
            .batch_execute(&format!("SET work_mem = '{}MB'", megabytes))
            .await?;
        Ok(())
    }

    fn rewrite<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        let statement = self.hooks.apply(sql);
        if let Cow::Owned(ref rewritten) = statement {
            trace!(original = sql, rewritten = rewritten.as_str(), "Statement rewritten");
        }
        statement
    }
}

impl Executable for TestConnection {
    async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, tokio_postgres::Error> {
        let sql = self.rewrite(sql);
        self.client().query(sql.as_ref(), params).await
    }

    async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, tokio_postgres::Error> {
        let sql = self.rewrite(sql);
        self.client().query_one(sql.as_ref(), params).await
    }

    async fn batch_execute(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        let sql = self.rewrite(sql);
        self.client().batch_execute(sql.as_ref()).await
    }
}

impl fmt::Debug for TestConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.handle {
            ClientHandle::Pooled(_) => "pooled",
            ClientHandle::Direct(_) => "direct",
        };
        f.debug_struct("TestConnection")
            .field("kind", &kind)
            .field("hooks", &self.hooks)
            .finish()
    }
}
