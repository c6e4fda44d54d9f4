//! Client facade over one connection pool.

use crate::config::{DatabaseConfig, PoolConfig};
use crate::db::{
    AdapterRegistry, ConnectionPool, PoolStatus, PooledConnection, Transaction,
    TransactionManager,
};
use crate::error::DbResult;
use crate::models::{CompiledQuery, ResultSet};
use tracing::info;

/// Runs single statements on pooled connections and starts transactions.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct Client {
    id: String,
    pool: ConnectionPool,
    transactions: TransactionManager,
}

impl Client {
    /// Open a pool for `config` using the adapter registered for its driver.
    pub async fn connect(config: &DatabaseConfig, registry: &AdapterRegistry) -> DbResult<Self> {
        Self::connect_with(config, config.pool_config(), registry).await
    }

    /// Like `connect`, with an explicit pool configuration.
    pub async fn connect_with(
        config: &DatabaseConfig,
        pool_config: PoolConfig,
        registry: &AdapterRegistry,
    ) -> DbResult<Self> {
        let factory = registry.factory_for(config.dsn.driver)?;
        let pool = ConnectionPool::connect(config.dsn.clone(), pool_config, factory).await?;
        info!(connection_id = %config.id, db_type = %config.dsn.driver, "Client connected");
        Ok(Self::from_pool(config.id.clone(), pool))
    }

    /// Wrap an existing pool.
    pub fn from_pool(id: impl Into<String>, pool: ConnectionPool) -> Self {
        Self {
            id: id.into(),
            transactions: TransactionManager::new(pool.clone()),
            pool,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run a row-returning statement on a pooled connection.
    pub async fn query(&self, query: impl Into<CompiledQuery>) -> DbResult<ResultSet> {
        self.run(query.into()).await
    }

    /// Run a statement for its side effects and return the affected row count.
    pub async fn execute(&self, query: impl Into<CompiledQuery>) -> DbResult<u64> {
        let result = self.run(query.into()).await?;
        Ok(result.rows_affected.unwrap_or(0))
    }

    async fn run(&self, query: CompiledQuery) -> DbResult<ResultSet> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(&query).await;
        conn.release().await;
        result
    }

    /// Check out a connection for several statements outside a transaction.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.pool.acquire().await
    }

    pub async fn begin(&self) -> DbResult<Transaction> {
        self.transactions.begin().await
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
