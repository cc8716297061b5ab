//! Built-in backend links over `sqlx::AnyConnection`.
//!
//! Every execution context owns exactly one dedicated connection instead of
//! a pool, so terminating the link really ends the backend session.

use super::{BackendLink, Connector, SqlDialect};
use crate::Result;
use crate::config::ConnectionConfig;
use crate::error::ContextError;
use async_trait::async_trait;
use sqlx::{AnyConnection, Connection, Executor, Row};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// How long `terminate` waits for an in-flight statement before giving up
/// on a graceful close.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Connector for the `sqlx` drivers compiled into this build.
#[derive(Debug, Clone, Copy)]
pub struct SqlxConnector {
    dialect: SqlDialect,
}

impl SqlxConnector {
    /// Creates a connector speaking `dialect`.
    pub fn new(dialect: SqlDialect) -> Self {
        sqlx::any::install_default_drivers();
        Self { dialect }
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    async fn connect(&self, url: &str, config: &ConnectionConfig) -> Result<Arc<dyn BackendLink>> {
        let url = match self.dialect {
            SqlDialect::Sqlite => normalize_sqlite_url(url, config.read_only),
            _ => url.to_string(),
        };

        let mut conn = AnyConnection::connect(&url).await.map_err(|e| {
            ContextError::network_failed(
                format!("Failed to connect to {} backend", self.dialect),
                e,
            )
        })?;

        if config.read_only
            && let Some(sql) = self.dialect.read_only_sql()
        {
            execute_raw(&mut conn, sql)
                .await
                .map_err(|e| map_sqlx_error("Failed to enable read-only session", e))?;
        }

        tracing::debug!("Opened {} backend link", self.dialect);

        Ok(Arc::new(SqlxLink::new(conn)))
    }
}

/// A dedicated `sqlx` connection guarded by its own mutex.
pub struct SqlxLink {
    conn: Mutex<Option<AnyConnection>>,
    terminated: AtomicBool,
}

impl SqlxLink {
    /// Wraps an open connection.
    pub fn new(conn: AnyConnection) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            terminated: AtomicBool::new(false),
        }
    }

    fn terminated_error() -> ContextError {
        ContextError::network("Backend link has been terminated")
    }
}

impl std::fmt::Debug for SqlxLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxLink")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[async_trait]
impl BackendLink for SqlxLink {
    async fn ping(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if self.is_terminated() {
            guard.take();
            return Err(Self::terminated_error());
        }
        let conn = guard.as_mut().ok_or_else(Self::terminated_error)?;
        conn.ping()
            .await
            .map_err(|e| ContextError::network_failed("Alive probe failed", e))
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut guard = self.conn.lock().await;
        if self.is_terminated() {
            guard.take();
            return Err(Self::terminated_error());
        }
        let conn = guard.as_mut().ok_or_else(Self::terminated_error)?;
        execute_raw(conn, sql)
            .await
            .map_err(|e| map_sqlx_error("Statement failed", e))
    }

    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        let mut guard = self.conn.lock().await;
        if self.is_terminated() {
            guard.take();
            return Err(Self::terminated_error());
        }
        let conn = guard.as_mut().ok_or_else(Self::terminated_error)?;
        fetch_first_i64(conn, sql)
            .await
            .map_err(|e| map_sqlx_error("Query failed", e))
    }

    async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        // An in-flight statement keeps the lock; the connection is then
        // dropped by the next caller that observes the terminated flag.
        let Ok(mut guard) = tokio::time::timeout(TERMINATE_GRACE, self.conn.lock()).await else {
            tracing::debug!("Backend link busy, deferring close");
            return;
        };

        if let Some(conn) = guard.take() {
            match tokio::time::timeout(TERMINATE_GRACE, conn.close()).await {
                Ok(Ok(())) => tracing::debug!("Backend link closed"),
                Ok(Err(e)) => tracing::debug!("Backend link closed with error: {}", e),
                Err(_) => tracing::debug!("Backend link close timed out"),
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

// Statements go through `Executor` methods so the futures stay `Send`
// inside `#[async_trait]` bodies.

async fn execute_raw(conn: &mut AnyConnection, sql: &str) -> std::result::Result<u64, sqlx::Error> {
    let result = (&mut *conn).execute(sqlx::raw_sql(sql)).await?;
    Ok(result.rows_affected())
}

async fn fetch_first_i64(conn: &mut AnyConnection, sql: &str) -> std::result::Result<i64, sqlx::Error> {
    let row = (&mut *conn).fetch_one(sqlx::query(sql)).await?;
    row.try_get::<i64, _>(0)
}

/// Classifies a driver error as transport or statement failure.
fn map_sqlx_error(context: &str, error: sqlx::Error) -> ContextError {
    if matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    ) {
        ContextError::network_failed(context, error)
    } else {
        ContextError::query_failed(context, error)
    }
}

/// Normalizes a SQLite target to a `sqlite:` URL, optionally read-only.
fn normalize_sqlite_url(connection_string: &str, read_only: bool) -> String {
    let url = if connection_string == ":memory:" {
        "sqlite::memory:".to_string()
    } else if connection_string.starts_with("sqlite:") {
        connection_string.to_string()
    } else {
        format!("sqlite://{}", connection_string)
    };

    if !read_only || url.contains(":memory:") || url.contains("mode=") {
        return url;
    }

    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}mode=ro", url, separator)
}
