//! Shared test helpers: a scripted in-memory adapter.
//!
//! Every adapter opened by a `Mock` factory records its activity in one shared
//! `MockState`, and reads its failure switches from there.

#![allow(dead_code)]

use async_trait::async_trait;
use db_access::config::PoolConfig;
use db_access::db::{Adapter, AdapterFactory, ConnectionPool, StatementHandle};
use db_access::error::{DbError, DbResult};
use db_access::models::{DatabaseType, Dsn, QueryParam, ResultSet};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct MockState {
    pub opens: u64,
    pub closes: u64,
    /// SQL prepared, per mock connection.
    pub prepares: HashMap<u64, Vec<String>>,
    /// SQL of statements closed through `close_statement`.
    pub closed_statements: Vec<String>,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub pings: u64,

    pub fail_open: bool,
    /// Number of upcoming pings that report unhealthy.
    pub failing_pings: u32,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    /// Number of upcoming executes that fail with a connection fault.
    pub faulty_executes: u32,
    pub execute_delay: Option<Duration>,
    pub ping_delay: Option<Duration>,
    pub commit_delay: Option<Duration>,
}

impl MockState {
    pub fn prepare_count(&self, conn: u64) -> usize {
        self.prepares.get(&conn).map_or(0, Vec::len)
    }

    pub fn total_prepares(&self) -> usize {
        self.prepares.values().map(Vec::len).sum()
    }
}

#[derive(Clone, Default)]
pub struct Mock {
    state: Arc<Mutex<MockState>>,
}

impl Mock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn AdapterFactory> {
        Arc::new(MockFactory {
            state: Arc::clone(&self.state),
        })
    }

    /// Read or change the shared state.
    pub fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn snapshot(&self) -> MockState {
        self.state.lock().unwrap().clone()
    }
}

struct MockFactory {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl AdapterFactory for MockFactory {
    async fn open(&self, _dsn: &Dsn, _config: &PoolConfig) -> DbResult<Box<dyn Adapter>> {
        let mut st = self.state.lock().unwrap();
        if st.fail_open {
            return Err(DbError::connect(
                "connection refused",
                "Check that the server is running",
            ));
        }
        st.opens += 1;
        Ok(Box::new(MockAdapter {
            conn_id: st.opens,
            state: Arc::clone(&self.state),
            statements: HashMap::new(),
            next_handle: 1,
        }))
    }
}

struct MockAdapter {
    conn_id: u64,
    state: Arc<Mutex<MockState>>,
    statements: HashMap<StatementHandle, String>,
    next_handle: u64,
}

impl MockAdapter {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn prepare(&mut self, sql: &str) -> DbResult<StatementHandle> {
        self.state()
            .prepares
            .entry(self.conn_id)
            .or_default()
            .push(sql.to_string());
        if sql.contains("INVALID") {
            return Err(DbError::prepare(
                "syntax error at or near \"INVALID\"",
                Some("42601".into()),
                false,
            ));
        }
        let handle = StatementHandle(self.next_handle);
        self.next_handle += 1;
        self.statements.insert(handle, sql.to_string());
        Ok(handle)
    }

    async fn execute(
        &mut self,
        statement: StatementHandle,
        params: &[QueryParam],
    ) -> DbResult<ResultSet> {
        let sql = self
            .statements
            .get(&statement)
            .cloned()
            .ok_or_else(|| DbError::exec("unknown statement", None, false))?;

        let delay = {
            let mut st = self.state();
            if st.faulty_executes > 0 {
                st.faulty_executes -= 1;
                return Err(DbError::exec("connection reset by peer", None, true));
            }
            st.execute_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if sql.contains("FAIL") {
            return Err(DbError::exec(
                "constraint violated",
                Some("23000".into()),
                false,
            ));
        }
        if sql.trim_start().to_uppercase().starts_with("SELECT") {
            let mut row = serde_json::Map::new();
            row.insert("conn".into(), json!(self.conn_id));
            row.insert("params".into(), json!(params.len()));
            return Ok(ResultSet {
                columns: vec!["conn".into(), "params".into()],
                rows: vec![row],
                rows_affected: None,
            });
        }
        Ok(ResultSet::write_result(1))
    }

    async fn close_statement(&mut self, statement: StatementHandle) -> DbResult<()> {
        if let Some(sql) = self.statements.remove(&statement) {
            self.state().closed_statements.push(sql);
        }
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<bool> {
        let delay = {
            let mut st = self.state();
            st.pings += 1;
            if st.failing_pings > 0 {
                st.failing_pings -= 1;
                return Ok(false);
            }
            st.ping_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(true)
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.state().begins += 1;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let delay = self.state().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut st = self.state();
        if st.fail_commit {
            return Err(DbError::exec("server closed the connection", None, true));
        }
        st.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let mut st = self.state();
        if st.fail_rollback {
            return Err(DbError::exec("server closed the connection", None, true));
        }
        st.rollbacks += 1;
        Ok(())
    }

    async fn close(&mut self) -> DbResult<()> {
        self.state().closes += 1;
        Ok(())
    }
}

pub fn dsn() -> Dsn {
    Dsn::new(DatabaseType::PostgreSQL)
        .with_host("mock")
        .with_database("test")
}

/// Small, fast pool settings; no connections opened up front.
pub fn test_config() -> PoolConfig {
    PoolConfig::default()
        .with_min_size(0)
        .with_max_size(2)
        .with_acquire_timeout(Duration::from_secs(2))
        .with_maintenance_interval(Duration::from_millis(20))
        .with_drain_timeout(Duration::from_secs(2))
}

pub async fn pool(mock: &Mock, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::connect(dsn(), config, mock.factory())
        .await
        .unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
