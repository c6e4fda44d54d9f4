//! Database access core.
//!
//! One client-facing API over heterogeneous relational backends (MySQL,
//! PostgreSQL, SQLite, and any driver registered through an `AdapterFactory`):
//! a bounded connection pool, a per-connection prepared statement cache, and
//! transactions pinned to a single connection.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;

pub use client::Client;
pub use config::{Config, DatabaseConfig, PoolConfig, PoolOptions};
pub use db::{
    Adapter, AdapterFactory, AdapterRegistry, ConnectionPool, PooledConnection, Transaction,
    TransactionManager,
};
pub use error::{DbError, DbResult};
pub use models::{CompiledQuery, DatabaseType, Dsn, QueryParam, ResultSet};
