//! Database access layer.
//!
//! This module provides:
//! - The backend adapter contract and the sqlx-backed adapters
//! - Row type mappings for those adapters
//! - The per-connection prepared statement cache
//! - Pooled connections and the connection pool
//! - Transactions pinned to one pooled connection

pub mod adapter;
pub mod connection;
pub mod pool;
pub mod sqlx_adapter;
pub mod statement_cache;
pub mod transaction;
pub mod types;

pub use adapter::{Adapter, AdapterFactory, AdapterRegistry, StatementHandle};
pub use connection::{Connection, ConnectionState};
pub use pool::{ConnectionPool, Health, PoolStatus, PooledConnection};
pub use sqlx_adapter::{SqlxAdapter, SqlxAdapterFactory};
pub use statement_cache::{CacheStats, PreparedStatementCache, normalize_sql};
pub use transaction::{ExecutedStatement, Transaction, TransactionManager, TransactionState};
