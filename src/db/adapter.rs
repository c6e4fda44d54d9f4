//! Backend adapter contract.
//!
//! An `Adapter` owns exactly one physical connection to a backend. The pool never
//! talks to a driver directly; it opens adapters through the `AdapterFactory`
//! registered for the DSN's driver.

use crate::config::PoolConfig;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Dsn, QueryParam, ResultSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque handle to a statement prepared on one adapter.
///
/// Handles are only meaningful to the adapter that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementHandle(pub u64);

impl fmt::Display for StatementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

/// One physical backend connection.
///
/// Errors caused by the link itself (I/O, protocol) must be reported with
/// `connection_fault = true` so the pool can dispose of the connection.
#[async_trait]
pub trait Adapter: Send {
    fn database_type(&self) -> DatabaseType;

    /// Prepare `sql` on the backend and return a handle for later execution.
    async fn prepare(&mut self, sql: &str) -> DbResult<StatementHandle>;

    async fn execute(
        &mut self,
        statement: StatementHandle,
        params: &[QueryParam],
    ) -> DbResult<ResultSet>;

    /// Release backend resources held by a prepared statement.
    async fn close_statement(&mut self, statement: StatementHandle) -> DbResult<()>;

    /// Liveness check. `Ok(false)` and `Err(_)` both mean unhealthy.
    async fn ping(&mut self) -> DbResult<bool>;

    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Close the physical connection. Must be safe to call more than once.
    async fn close(&mut self) -> DbResult<()>;
}

/// Opens adapters for one driver.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open(&self, dsn: &Dsn, config: &PoolConfig) -> DbResult<Box<dyn Adapter>>;
}

/// Maps each driver to the factory that opens its connections.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<DatabaseType, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in sqlx adapters (MySQL, PostgreSQL, SQLite).
    pub fn with_defaults() -> Self {
        let factory: Arc<dyn AdapterFactory> = Arc::new(super::sqlx_adapter::SqlxAdapterFactory);
        let mut registry = Self::new();
        for db_type in [
            DatabaseType::MySQL,
            DatabaseType::PostgreSQL,
            DatabaseType::SQLite,
        ] {
            registry.factories.insert(db_type, factory.clone());
        }
        registry
    }

    /// Register (or replace) the factory for a driver.
    pub fn register(&mut self, db_type: DatabaseType, factory: Arc<dyn AdapterFactory>) -> &mut Self {
        self.factories.insert(db_type, factory);
        self
    }

    pub fn is_registered(&self, db_type: DatabaseType) -> bool {
        self.factories.contains_key(&db_type)
    }

    pub fn factory_for(&self, db_type: DatabaseType) -> DbResult<Arc<dyn AdapterFactory>> {
        self.factories.get(&db_type).cloned().ok_or_else(|| {
            DbError::connect(
                format!("No adapter registered for {}", db_type),
                format!(
                    "Register an AdapterFactory for '{}' before opening a pool",
                    db_type.scheme()
                ),
            )
        })
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut drivers: Vec<_> = self.factories.keys().map(|d| d.scheme()).collect();
        drivers.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("drivers", &drivers)
            .finish()
    }
}
