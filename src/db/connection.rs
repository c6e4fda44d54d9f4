//! A pooled physical connection: one adapter, its statement cache, and lifecycle state.

use super::adapter::{Adapter, StatementHandle};
use super::statement_cache::{CacheStats, PreparedStatementCache};
use crate::error::{DbError, DbResult};
use crate::models::{CompiledQuery, DatabaseType, QueryParam, ResultSet};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    /// Must never be handed out again; closed on release.
    Broken,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::InUse => "in_use",
            Self::Broken => "broken",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Connection {
    id: u64,
    adapter: Box<dyn Adapter>,
    statements: PreparedStatementCache,
    state: ConnectionState,
    created_at: Instant,
    last_used: Instant,
    in_transaction: bool,
    /// Set while an adapter call is in flight. Still set after the call means
    /// the caller's future was dropped mid-operation.
    busy: bool,
    statement_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        adapter: Box<dyn Adapter>,
        cache_capacity: usize,
        statement_timeout: Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            adapter,
            statements: PreparedStatementCache::new(cache_capacity),
            state: ConnectionState::Idle,
            created_at: now,
            last_used: now,
            in_transaction: false,
            busy: false,
            statement_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn database_type(&self) -> DatabaseType {
        self.adapter.database_type()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Time since the connection last did any work.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_broken(&self) -> bool {
        self.state == ConnectionState::Broken
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Whether an operation on this connection was interrupted before the
    /// backend answered.
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.statements.stats()
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    /// Whether `sql` is in this connection's statement cache.
    pub fn is_cached(&self, sql: &str) -> bool {
        self.statements.contains(sql)
    }

    /// Mark this connection as unusable; the pool disposes of it on release.
    pub fn mark_broken(&mut self, reason: &str) {
        if self.state != ConnectionState::Broken && self.state != ConnectionState::Closed {
            warn!(connection_id = self.id, reason, "Connection marked broken");
            self.state = ConnectionState::Broken;
        }
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        if self.state != ConnectionState::Broken || state == ConnectionState::Closed {
            if state == ConnectionState::Idle {
                self.last_used = Instant::now();
            }
            self.state = state;
        }
    }

    fn ensure_usable(&mut self) -> DbResult<()> {
        if self.busy {
            self.mark_broken("previous operation was interrupted");
        }
        match self.state {
            ConnectionState::Broken => Err(DbError::connection_broken(
                self.id,
                "connection is marked broken",
            )),
            ConnectionState::Closed => Err(DbError::connection_broken(
                self.id,
                "connection is closed",
            )),
            _ => Ok(()),
        }
    }

    /// Break the connection if `result` failed because of the link.
    fn observe<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_connection_fault() {
                self.mark_broken(&e.to_string());
            }
        }
        result
    }

    /// Get the statement handle for `sql`, preparing it on a cache miss.
    pub async fn prepare(&mut self, sql: &str) -> DbResult<StatementHandle> {
        self.ensure_usable()?;
        self.last_used = Instant::now();
        self.busy = true;
        let result = self
            .statements
            .get_or_prepare(self.adapter.as_mut(), sql)
            .await;
        self.busy = false;
        self.observe(result)
    }

    /// Execute a compiled query through the statement cache.
    pub async fn execute(&mut self, query: &CompiledQuery) -> DbResult<ResultSet> {
        self.execute_sql(&query.sql, &query.params).await
    }

    pub async fn execute_sql(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
        let statement = self.prepare(sql).await?;
        self.last_used = Instant::now();

        let started = Instant::now();
        self.busy = true;
        let result = match self.statement_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.adapter.execute(statement, params)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // The backend may still be running it
                        self.busy = false;
                        self.mark_broken("statement timed out");
                        return Err(DbError::timeout("statement execution", started.elapsed()));
                    }
                }
            }
            None => self.adapter.execute(statement, params).await,
        };
        self.busy = false;
        self.last_used = Instant::now();

        debug!(
            connection_id = self.id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Statement executed"
        );
        self.observe(result)
    }

    /// Ping the backend. Any error, a negative answer, or no answer within
    /// `timeout` counts as unhealthy.
    pub async fn ping(&mut self, timeout: Duration) -> bool {
        if self.ensure_usable().is_err() {
            return false;
        }
        self.busy = true;
        let outcome = tokio::time::timeout(timeout, self.adapter.ping()).await;
        self.busy = false;
        match outcome {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => false,
            Ok(Err(e)) => {
                debug!(connection_id = self.id, error = %e, "Health check failed");
                false
            }
            Err(_) => {
                // A late answer would desync the protocol
                self.mark_broken("health check timed out");
                false
            }
        }
    }

    pub async fn begin(&mut self) -> DbResult<()> {
        self.ensure_usable()?;
        if self.in_transaction {
            return Err(DbError::transaction_already_open(self.id));
        }
        self.busy = true;
        let result = self.adapter.begin().await;
        self.busy = false;
        let result = self.observe(result);
        if result.is_ok() {
            self.in_transaction = true;
            self.last_used = Instant::now();
        }
        result
    }

    /// Commit the open transaction. The connection leaves transaction mode
    /// once the backend answers, whatever the outcome.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_usable()?;
        self.last_used = Instant::now();
        self.busy = true;
        let result = self.adapter.commit().await;
        self.busy = false;
        self.in_transaction = false;
        self.observe(result)
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_usable()?;
        self.last_used = Instant::now();
        self.busy = true;
        let result = self.adapter.rollback().await;
        self.busy = false;
        self.in_transaction = false;
        self.observe(result)
    }

    /// Close cached statements and the physical connection.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        if self.state == ConnectionState::Broken {
            self.statements.invalidate();
        } else {
            self.statements.clear(self.adapter.as_mut()).await;
        }
        if let Err(e) = self.adapter.close().await {
            debug!(connection_id = self.id, error = %e, "Error while closing connection");
        }
        self.state = ConnectionState::Closed;
        debug!(connection_id = self.id, "Connection closed");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("database_type", &self.database_type())
            .field("state", &self.state)
            .field("in_transaction", &self.in_transaction)
            .field("busy", &self.busy)
            .field("cached_statements", &self.statements.len())
            .finish()
    }
}
