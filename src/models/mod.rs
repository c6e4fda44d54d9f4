//! Data models for the database access core.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, Dsn, DsnError};
pub use query::{CompiledQuery, QueryParam, ResultSet};
