//! Transaction coordination.
//!
//! A `Transaction` pins one pooled connection from `begin` until it is committed,
//! rolled back, or dropped. Every statement runs on that connection. Dropping an
//! open transaction rolls it back (see `PooledConnection`), so early returns and
//! `?` never leak a connection with a transaction still open.

use super::pool::{ConnectionPool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{CompiledQuery, QueryParam, ResultSet};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
    /// The connection failed mid-transaction or commit/rollback failed.
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Diagnostic record of one statement run inside a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedStatement {
    pub sql: String,
    pub param_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub row_count: usize,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// An open transaction on a pinned connection.
pub struct Transaction {
    id: String,
    conn: Option<PooledConnection>,
    state: TransactionState,
    statements: Vec<ExecutedStatement>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Transaction {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Statements executed so far, in order.
    pub fn statements(&self) -> &[ExecutedStatement] {
        &self.statements
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Id of the pinned connection.
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    fn pinned(&mut self) -> DbResult<&mut PooledConnection> {
        if self.state != TransactionState::Open {
            return Err(DbError::transaction(
                format!("Transaction is {}", self.state),
                &self.id,
            ));
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction has no connection", &self.id))
    }

    /// Execute a statement on the pinned connection.
    ///
    /// Statement errors leave the transaction open; a connection fault fails it.
    pub async fn execute(&mut self, query: &CompiledQuery) -> DbResult<ResultSet> {
        self.execute_sql(&query.sql, &query.params).await
    }

    pub async fn execute_sql(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        let conn = self.pinned()?;
        let result = conn.execute_sql(sql, params).await;
        let broken = conn.is_broken();

        self.statements.push(ExecutedStatement {
            sql: sql.to_string(),
            param_count: params.len(),
            rows_affected: result.as_ref().ok().and_then(|r| r.rows_affected),
            row_count: result.as_ref().map(|r| r.row_count()).unwrap_or(0),
            succeeded: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            executed_at: Utc::now(),
        });

        if broken {
            warn!(transaction_id = %self.id, "Connection failed mid-transaction");
            self.state = TransactionState::Failed;
        }
        result
    }

    /// Commit and release the connection.
    ///
    /// On failure the connection is treated as broken and disposed of, and the
    /// error is returned.
    pub async fn commit(mut self) -> DbResult<()> {
        self.pinned()?;
        let Some(mut conn) = self.conn.take() else {
            return Err(DbError::transaction("Transaction has no connection", &self.id));
        };

        match conn.commit().await {
            Ok(()) => {
                self.state = TransactionState::Committed;
                conn.release().await;
                info!(
                    transaction_id = %self.id,
                    statements = self.statements.len(),
                    duration_ms = self.started.elapsed().as_millis() as u64,
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                conn.mark_broken("commit failed");
                conn.release().await;
                warn!(transaction_id = %self.id, error = %e, "Commit failed");
                Err(e)
            }
        }
    }

    /// Roll back and release the connection.
    ///
    /// The connection is always released; it is disposed of only if the rollback
    /// itself fails.
    pub async fn rollback(mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Err(DbError::transaction("Transaction has no connection", &self.id));
        };

        match conn.rollback().await {
            Ok(()) => {
                self.state = TransactionState::RolledBack;
                conn.release().await;
                info!(transaction_id = %self.id, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                conn.mark_broken("rollback failed");
                conn.release().await;
                warn!(transaction_id = %self.id, error = %e, "Rollback failed");
                Err(e)
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                transaction_id = %self.id,
                state = %self.state,
                "Transaction dropped without commit or rollback, rolling back"
            );
        }
        // PooledConnection's own Drop performs the rollback and release
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("connection_id", &self.connection_id())
            .field("statements", &self.statements.len())
            .finish()
    }
}

/// Starts transactions on connections from one pool.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    pool: ConnectionPool,
}

impl TransactionManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Acquire a connection and begin a transaction on it.
    pub async fn begin(&self) -> DbResult<Transaction> {
        let conn = self.pool.acquire().await?;
        Self::begin_on(conn).await
    }

    /// Begin a transaction on an already checked-out connection.
    ///
    /// Fails with `TransactionAlreadyOpen` if the connection has one open. On any
    /// error the connection is handed back to the pool, rolling back whatever it
    /// had open.
    pub async fn begin_on(mut conn: PooledConnection) -> DbResult<Transaction> {
        conn.begin().await?;

        let tx = Transaction {
            id: generate_transaction_id(),
            conn: Some(conn),
            state: TransactionState::Open,
            statements: Vec::new(),
            started_at: Utc::now(),
            started: Instant::now(),
        };
        debug!(
            transaction_id = %tx.id,
            connection_id = ?tx.connection_id(),
            "Transaction started"
        );
        Ok(tx)
    }

    pub async fn commit(&self, tx: Transaction) -> DbResult<()> {
        tx.commit().await
    }

    pub async fn rollback(&self, tx: Transaction) -> DbResult<()> {
        tx.rollback().await
    }
}
