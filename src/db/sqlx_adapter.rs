//! sqlx-backed adapters for MySQL, PostgreSQL and SQLite.
//!
//! Each `SqlxAdapter` wraps one sqlx connection. Statements are prepared through
//! `Executor::prepare` and executed as persistent queries, so the backend-side
//! prepared statement lives in sqlx's own per-connection cache. That cache is sized
//! to the pool's `statement_cache_capacity` so both caches evict together.

use super::adapter::{Adapter, AdapterFactory, StatementHandle};
use super::types::RowToJson;
use crate::config::PoolConfig;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Dsn, QueryParam, ResultSet};
use async_trait::async_trait;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection};
use sqlx::{Column, ConnectOptions, Connection, Executor, MySql, Postgres, Sqlite, Statement};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// DSN option giving the connect timeout in seconds.
const CONNECT_TIMEOUT_OPTION: &str = "timeout";

/// The live sqlx connection behind an adapter.
enum BackendConnection {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SQLite(SqliteConnection),
}

/// Bookkeeping for a statement prepared through this adapter.
#[derive(Debug, Clone)]
struct PreparedStatement {
    sql: String,
    columns: Vec<String>,
    returns_rows: bool,
}

/// One sqlx connection exposed through the `Adapter` contract.
pub struct SqlxAdapter {
    db_type: DatabaseType,
    /// Taken on close.
    conn: Option<BackendConnection>,
    statements: HashMap<StatementHandle, PreparedStatement>,
    next_handle: u64,
}

/// Bind a parameter to a MySQL query.
fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a PostgreSQL query.
fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn column_names<'q, S: Statement<'q>>(statement: &S) -> Vec<String> {
    statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect()
}

impl SqlxAdapter {
    fn new(db_type: DatabaseType, conn: BackendConnection) -> Self {
        Self {
            db_type,
            conn: Some(conn),
            statements: HashMap::new(),
            next_handle: 1,
        }
    }

    fn conn(&mut self) -> DbResult<&mut BackendConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::exec("Connection already closed", None, true))
    }

    async fn simple(&mut self, sql: &'static str) -> DbResult<()> {
        match self.conn()? {
            BackendConnection::MySql(c) => {
                c.execute(sql).await?;
            }
            BackendConnection::Postgres(c) => {
                c.execute(sql).await?;
            }
            BackendConnection::SQLite(c) => {
                c.execute(sql).await?;
            }
        }
        Ok(())
    }

    /// Open a connection for `dsn`.
    pub async fn connect(dsn: &Dsn, config: &PoolConfig) -> DbResult<Self> {
        let db_type = dsn.driver;
        let connect_timeout = dsn
            .options
            .get(CONNECT_TIMEOUT_OPTION)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let url = dsn.to_url_without(&[CONNECT_TIMEOUT_OPTION]);
        let capacity = config.statement_cache_capacity;

        debug!(dsn = %dsn.masked(), "Opening connection");

        let connect = async {
            let conn = match db_type {
                DatabaseType::MySQL => {
                    let mut options = MySqlConnectOptions::from_str(&url)?
                        .statement_cache_capacity(capacity);
                    if !dsn.options.contains_key("charset") {
                        options = options.charset("utf8mb4");
                    }
                    BackendConnection::MySql(options.connect().await?)
                }
                DatabaseType::PostgreSQL => {
                    let options =
                        PgConnectOptions::from_str(&url)?.statement_cache_capacity(capacity);
                    BackendConnection::Postgres(options.connect().await?)
                }
                DatabaseType::SQLite => {
                    let options =
                        SqliteConnectOptions::from_str(&url)?.statement_cache_capacity(capacity);
                    BackendConnection::SQLite(options.connect().await?)
                }
                other => {
                    return Err(sqlx::Error::Configuration(
                        format!("{} is not supported by the sqlx adapter", other).into(),
                    ));
                }
            };
            Ok::<_, sqlx::Error>(conn)
        };

        let result = match connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| {
                    DbError::connect(
                        format!("Timed out after {}s connecting to {}", limit.as_secs(), db_type),
                        format!("Check that the {} server is reachable", db_type),
                    )
                })?,
            None => connect.await,
        };

        result
            .map(|conn| Self::new(db_type, conn))
            .map_err(|e| DbError::connect(e.to_string(), connection_suggestion(db_type, &e)))
    }
}

#[async_trait]
impl Adapter for SqlxAdapter {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn prepare(&mut self, sql: &str) -> DbResult<StatementHandle> {
        let columns = match self.conn()? {
            BackendConnection::MySql(c) => {
                column_names(&c.prepare(sql).await.map_err(|e| DbError::from(e).into_prepare())?)
            }
            BackendConnection::Postgres(c) => {
                column_names(&c.prepare(sql).await.map_err(|e| DbError::from(e).into_prepare())?)
            }
            BackendConnection::SQLite(c) => {
                column_names(&c.prepare(sql).await.map_err(|e| DbError::from(e).into_prepare())?)
            }
        };

        let handle = StatementHandle(self.next_handle);
        self.next_handle += 1;
        self.statements.insert(
            handle,
            PreparedStatement {
                sql: sql.to_string(),
                returns_rows: !columns.is_empty(),
                columns,
            },
        );
        Ok(handle)
    }

    async fn execute(
        &mut self,
        statement: StatementHandle,
        params: &[QueryParam],
    ) -> DbResult<ResultSet> {
        let prepared = self
            .statements
            .get(&statement)
            .cloned()
            .ok_or_else(|| DbError::exec(format!("Unknown statement {}", statement), None, false))?;
        let sql = prepared.sql.as_str();

        macro_rules! run {
            ($conn:expr, $bind:path) => {{
                let mut query = sqlx::query(sql);
                for param in params {
                    query = $bind(query, param);
                }
                if prepared.returns_rows {
                    let rows = query.fetch_all(&mut *$conn).await?;
                    ResultSet {
                        columns: prepared.columns.clone(),
                        rows: rows.iter().map(|r| r.to_json_map()).collect(),
                        rows_affected: None,
                    }
                } else {
                    let result = query.execute(&mut *$conn).await?;
                    ResultSet::write_result(result.rows_affected())
                }
            }};
        }

        let result = match self.conn()? {
            BackendConnection::MySql(c) => run!(c, bind_mysql_param),
            BackendConnection::Postgres(c) => run!(c, bind_postgres_param),
            BackendConnection::SQLite(c) => run!(c, bind_sqlite_param),
        };
        Ok(result)
    }

    async fn close_statement(&mut self, statement: StatementHandle) -> DbResult<()> {
        // The backend statement itself is owned by sqlx's cache
        self.statements.remove(&statement);
        Ok(())
    }

    async fn ping(&mut self) -> DbResult<bool> {
        match self.conn()? {
            BackendConnection::MySql(c) => c.ping().await?,
            BackendConnection::Postgres(c) => c.ping().await?,
            BackendConnection::SQLite(c) => c.ping().await?,
        }
        Ok(true)
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.simple("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.simple("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.simple("ROLLBACK").await
    }

    async fn close(&mut self) -> DbResult<()> {
        self.statements.clear();
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match conn {
            BackendConnection::MySql(c) => c.close().await?,
            BackendConnection::Postgres(c) => c.close().await?,
            BackendConnection::SQLite(c) => c.close().await?,
        }
        Ok(())
    }
}

/// Opens `SqlxAdapter`s; registered for MySQL, PostgreSQL and SQLite by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlxAdapterFactory;

#[async_trait]
impl AdapterFactory for SqlxAdapterFactory {
    async fn open(&self, dsn: &Dsn, config: &PoolConfig) -> DbResult<Box<dyn Adapter>> {
        let adapter = SqlxAdapter::connect(dsn, config).await?;
        Ok(Box::new(adapter))
    }
}

/// Generate helpful suggestions based on the connection error.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!(
            "Check that the {} server is running and accessible",
            db_type
        );
    }

    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the username and password in the connection string".to_string();
    }

    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }

    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check TLS/SSL configuration or try disabling it".to_string();
    }

    match db_type {
        DatabaseType::SQLite => {
            "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite".to_string()
        }
        DatabaseType::MySQL | DatabaseType::PostgreSQL => format!(
            "Verify the connection string format: {}://user:pass@host:{}/db",
            db_type.scheme(),
            db_type.default_port().unwrap_or_default()
        ),
        other => format!("Register an adapter for {} to connect", other),
    }
}
