//! Error types for the database access core.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Pool-level variants (`PoolExhausted`, `PoolClosed`, `ConnectionBroken`) describe the
//! state of the pool; statement-level variants (`Prepare`, `Exec`) are surfaced verbatim
//! from the backend adapter.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connect { message: String, suggestion: String },

    #[error("Connection pool exhausted: no connection available within {waited_ms}ms (max_size: {max_size})")]
    PoolExhausted { waited_ms: u64, max_size: usize },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Prepare failed: {message}")]
    Prepare {
        message: String,
        /// e.g., "42601" for a syntax error
        sql_state: Option<String>,
        /// True when the failure was caused by the link, not the statement
        connection_fault: bool,
    },

    #[error("Execution failed: {message}")]
    Exec {
        message: String,
        sql_state: Option<String>,
        connection_fault: bool,
    },

    #[error("Connection {connection_id} is broken: {reason}")]
    ConnectionBroken { connection_id: u64, reason: String },

    #[error("A transaction is already open on connection {connection_id}")]
    TransactionAlreadyOpen { connection_id: u64 },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connect error with a helpful suggestion.
    pub fn connect(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connect {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a pool exhausted error for an acquire that waited `waited`.
    pub fn pool_exhausted(waited: Duration, max_size: usize) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
            max_size,
        }
    }

    /// Create a prepare error.
    pub fn prepare(
        message: impl Into<String>,
        sql_state: Option<String>,
        connection_fault: bool,
    ) -> Self {
        Self::Prepare {
            message: message.into(),
            sql_state,
            connection_fault,
        }
    }

    /// Create an execution error.
    pub fn exec(
        message: impl Into<String>,
        sql_state: Option<String>,
        connection_fault: bool,
    ) -> Self {
        Self::Exec {
            message: message.into(),
            sql_state,
            connection_fault,
        }
    }

    /// Create a broken connection error.
    pub fn connection_broken(connection_id: u64, reason: impl Into<String>) -> Self {
        Self::ConnectionBroken {
            connection_id,
            reason: reason.into(),
        }
    }

    pub fn transaction_already_open(connection_id: u64) -> Self {
        Self::TransactionAlreadyOpen { connection_id }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Re-tag a statement error raised while preparing.
    pub fn into_prepare(self) -> Self {
        match self {
            Self::Exec {
                message,
                sql_state,
                connection_fault,
            } => Self::Prepare {
                message,
                sql_state,
                connection_fault,
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connect { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => {
                Some("Release connections sooner or increase max_connections")
            }
            Self::TransactionAlreadyOpen { .. } => {
                Some("Commit or roll back the open transaction first")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::PoolExhausted { .. } | Self::ConnectionBroken { .. }
        )
    }

    /// Whether the physical connection can no longer be trusted after this error.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            Self::ConnectionBroken { .. } => true,
            Self::Prepare {
                connection_fault, ..
            }
            | Self::Exec {
                connection_fault, ..
            } => *connection_fault,
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// Database-reported errors are statement errors; transport-level failures mark the
/// connection as faulty so the pool disposes of it.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connect(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::exec(db_err.message(), code, false)
            }
            sqlx::Error::Io(io_err) => DbError::exec(format!("I/O error: {}", io_err), None, true),
            sqlx::Error::Tls(tls_err) => {
                DbError::exec(format!("TLS error: {}", tls_err), None, true)
            }
            sqlx::Error::Protocol(msg) => {
                DbError::exec(format!("Protocol error: {}", msg), None, true)
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DbError::exec(format!("Driver pool error: {}", err), None, true)
            }
            sqlx::Error::WorkerCrashed => {
                DbError::exec("Database worker crashed", None, true)
            }
            sqlx::Error::RowNotFound => DbError::exec("No rows returned", None, false),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::exec(format!("Column not found: {}", col), None, false)
            }
            sqlx::Error::ColumnDecode { index, source } => DbError::exec(
                format!("Failed to decode column {}: {}", index, source),
                None,
                false,
            ),
            sqlx::Error::Decode(source) => {
                DbError::exec(format!("Decode error: {}", source), None, false)
            }
            _ => DbError::exec(format!("Database error: {}", err), None, false),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
