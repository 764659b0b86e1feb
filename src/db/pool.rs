//! Adapter between bb8 and the sqlx::Postgres driver, plus the SQLite fallback pool.
use anyhow::{Context, Result, anyhow};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{CONNECT_TIMEOUT, PG_MAX_POOL_SIZE, PG_MIN_IDLE, PING_TIMEOUT, QUERY_TIMEOUT};
use crate::error::LoaderError;

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// The two database backends the loader knows how to bulk load into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Structural constraint DDL and `COPY ... FROM STDIN`
    Postgres,
    /// `PRAGMA foreign_keys` switch and multi-row `INSERT`
    Sqlite,
}

impl BackendKind {
    /// Parse a driver kind string (case-insensitive)
    pub fn parse(kind: &str) -> Result<Self, LoaderError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg8000" => Ok(BackendKind::Postgres),
            "sqlite" | "pysqlite" => Ok(BackendKind::Sqlite),
            _ => Err(LoaderError::UnsupportedBackend {
                kind: kind.to_string(),
            }),
        }
    }

    /// Resolve the backend from a connection URL scheme
    pub fn from_url(url: &str) -> Result<Self, LoaderError> {
        let scheme = url.split_once(':').map(|(scheme, _)| scheme).unwrap_or(url);
        Self::parse(scheme)
    }

    /// Table name as it appears in DML/DDL. SQLite has no schemas beyond `main`,
    /// so the schema is only used for Postgres.
    pub fn qualified_name(&self, schema: &str, name: &str) -> String {
        match self {
            BackendKind::Postgres => format!("{}.{}", quote_ident(schema), quote_ident(name)),
            BackendKind::Sqlite => quote_ident(name),
        }
    }
}

impl FromStr for BackendKind {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => write!(f, "postgres"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

impl Pool {
    /// Connect to the database named by `url`
    ///
    /// The backend kind is resolved before any connection attempt, so an
    /// unsupported scheme fails immediately with [`LoaderError::UnsupportedBackend`].
    pub async fn connect(url: &str) -> Result<Self> {
        match BackendKind::from_url(url)? {
            BackendKind::Postgres => Self::connect_postgres(url).await,
            BackendKind::Sqlite => Self::connect_sqlite(url).await,
        }
    }

    async fn connect_postgres(url: &str) -> Result<Self> {
        let connect_options =
            PgConnectOptions::from_str(url).context("Invalid Postgres connection URL")?;
        let conn_manager = ConnectionManager::new(connect_options);

        let bb8_pool = bb8::Builder::new()
            .min_idle(PG_MIN_IDLE)
            .max_size(PG_MAX_POOL_SIZE)
            .connection_timeout(CONNECT_TIMEOUT)
            .build(conn_manager)
            .await
            .context("Failed to create connection pool")?;

        Ok(Pool {
            inner: PoolInner::Postgres(bb8_pool),
        })
    }

    async fn connect_sqlite(url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(url)
            .context("Invalid SQLite connection URL")?
            .create_if_missing(true);

        // A single connection: `PRAGMA foreign_keys` is connection scoped and an
        // in-memory database only lives as long as its connection.
        let sqlite_pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .acquire_timeout(CONNECT_TIMEOUT)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context("Failed to open SQLite database")?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    /// Create an in-memory SQLite pool for testing
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self> {
        Self::connect_sqlite("sqlite::memory:").await
    }

    pub fn kind(&self) -> BackendKind {
        match &self.inner {
            PoolInner::Postgres(_) => BackendKind::Postgres,
            PoolInner::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    /// Generate the properly quoted table name for this backend
    pub fn qualified_table_name(&self, schema: &str, table: &str) -> String {
        self.kind().qualified_name(schema, table)
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(|e| match e {
                    bb8::RunError::User(e) => e,
                    bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
                })?;
                Ok(PoolConnection::Postgres(conn))
            }
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Execute a statement without bind parameters (DDL, TRUNCATE, PRAGMA)
    pub async fn execute_query(&self, sql: &str) -> Result<()> {
        let mut conn = self
            .acquire()
            .await
            .context("Failed to acquire connection from pool")?;

        let result = match &mut conn {
            PoolConnection::Postgres(conn) => {
                tokio::time::timeout(QUERY_TIMEOUT, sqlx::query(sql).execute(&mut **conn))
                    .await
                    .map(|r| r.map(|_| ()))
            }
            PoolConnection::Sqlite(conn) => {
                tokio::time::timeout(QUERY_TIMEOUT, sqlx::query(sql).execute(&mut **conn))
                    .await
                    .map(|r| r.map(|_| ()))
            }
        };

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e).with_context(|| format!("Failed to execute: {}", sql)),
            Err(_) => Err(anyhow!(
                "Query execution timed out after {} seconds: {}",
                QUERY_TIMEOUT.as_secs(),
                sql
            )),
        }
    }

    /// Close all connections. Required before dropping an in-memory database on purpose.
    pub async fn close(&self) {
        match &self.inner {
            PoolInner::Postgres(_) => {}
            PoolInner::Sqlite(pool) => pool.close().await,
        }
    }
}

pub struct ConnectionManager {
    connect_options: Arc<PgConnectOptions>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options: Arc::new(connect_options),
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)?
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, conn.ping())
            .await
            // bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!(BackendKind::parse("postgres").unwrap(), BackendKind::Postgres);
        assert_eq!(BackendKind::parse("PostgreSQL").unwrap(), BackendKind::Postgres);
        assert_eq!(BackendKind::parse("pg8000").unwrap(), BackendKind::Postgres);
        assert_eq!(BackendKind::parse("sqlite").unwrap(), BackendKind::Sqlite);
        assert_eq!(BackendKind::parse("pysqlite").unwrap(), BackendKind::Sqlite);
    }

    #[test]
    fn test_backend_kind_rejects_unknown() {
        let err = BackendKind::parse("mysql").unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedBackend { ref kind } if kind == "mysql"));
        assert!(err.to_string().contains("Unsupported database backend 'mysql'"));
    }

    #[test]
    fn test_backend_kind_from_url() {
        assert_eq!(
            BackendKind::from_url("postgres://user:pw@localhost:5432/omop").unwrap(),
            BackendKind::Postgres
        );
        assert_eq!(
            BackendKind::from_url("postgresql://localhost/omop").unwrap(),
            BackendKind::Postgres
        );
        assert_eq!(BackendKind::from_url("sqlite::memory:").unwrap(), BackendKind::Sqlite);
        assert_eq!(BackendKind::from_url("sqlite://vocab.db").unwrap(), BackendKind::Sqlite);
        assert!(BackendKind::from_url("mssql://localhost/omop").is_err());
        assert!(BackendKind::from_url("").is_err());
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(
            BackendKind::Postgres.qualified_name("vocab", "concept"),
            "\"vocab\".\"concept\""
        );
        assert_eq!(BackendKind::Sqlite.qualified_name("vocab", "concept"), "\"concept\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_connect_rejects_unsupported_backend_without_connecting() {
        let err = Pool::connect("oracle://db.example.com/omop").await.unwrap_err();
        let loader_err = err.downcast_ref::<LoaderError>().unwrap();
        assert!(matches!(loader_err, LoaderError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn test_sqlite_pool_shares_in_memory_database() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        assert_eq!(pool.kind(), BackendKind::Sqlite);

        pool.execute_query("CREATE TABLE t (id INTEGER)").await.unwrap();
        pool.execute_query("INSERT INTO t VALUES (1)").await.unwrap();

        let PoolConnection::Sqlite(mut conn) = pool.acquire().await.unwrap() else {
            panic!("expected sqlite connection");
        };
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM t")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
