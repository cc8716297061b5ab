//! Execution contexts over the built-in SQLite driver.
//!
//! This test suite covers:
//! - Driver resolution through the built-in registry
//! - Three-phase invalidation against a real file database
//! - Re-application of PRAGMA session variables on the replacement link
//! - Read-only connections

#![cfg(feature = "sqlite")]

use dbctx_core::driver::DriverRegistry;
use dbctx_core::error::ErrorKind;
use dbctx_core::{
    ConnectionConfig, DataSource, DataSourceConfig, InvalidatePhase, PhaseOutcome,
    ProgressMonitor, Result, SessionPurpose,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_source(config: DataSourceConfig) -> Result<Arc<DataSource>> {
    let registry = DriverRegistry::with_builtin_drivers();
    Ok(Arc::new(DataSource::from_registry(config, &registry)?))
}

fn file_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

// =============================================================================
// Basic Connectivity
// =============================================================================

#[tokio::test]
async fn test_memory_context_connects_and_queries() -> Result<()> {
    let source = sqlite_source(DataSourceConfig::from_url("scratch", "sqlite::memory:"))?;
    let monitor = ProgressMonitor::new();
    let context = source.open_context("Main", &monitor).await?;

    assert!(context.is_connected());
    assert!(context.context_defaults().is_none());

    let session = context.open_session(SessionPurpose::UserQuery, "select 1", &monitor)?;
    assert_eq!(session.fetch_count("SELECT 1").await?, 1);
    drop(session);

    context.check_context_alive(&monitor).await?;
    context.close().await;
    Ok(())
}

#[tokio::test]
async fn test_schema_change_is_unsupported() -> Result<()> {
    let source = sqlite_source(DataSourceConfig::from_url("scratch", "sqlite::memory:"))?;
    let monitor = ProgressMonitor::new();
    let context = source.open_context("Main", &monitor).await?;

    let err = context.set_default_schema("main", &monitor).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    Ok(())
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn test_file_data_survives_invalidation() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let url = file_url(&dir.path().join("app.db"));
    let source = sqlite_source(DataSourceConfig::from_url("app", url))?;
    let monitor = ProgressMonitor::new();
    let context = source.open_context("Main", &monitor).await?;

    let session = context.open_session(SessionPurpose::UserScript, "seed", &monitor)?;
    session
        .execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, name TEXT)")
        .await?;
    session
        .execute("INSERT INTO accounts (name) VALUES ('alpha'), ('beta')")
        .await?;
    drop(session);

    let outcomes = context.invalidate_full(&monitor).await?;
    assert_eq!(outcomes[0], (InvalidatePhase::BeforeInvalidate, PhaseOutcome::Completed));
    assert_eq!(outcomes[1], (InvalidatePhase::Invalidate, PhaseOutcome::Completed));
    assert_eq!(context.generation(), 2);

    let session = context.open_session(SessionPurpose::UserQuery, "count", &monitor)?;
    assert_eq!(session.fetch_count("SELECT COUNT(*) FROM accounts").await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_session_from_previous_link_is_stale() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let url = file_url(&dir.path().join("stale.db"));
    let source = sqlite_source(DataSourceConfig::from_url("app", url))?;
    let monitor = ProgressMonitor::new();
    let context = source.open_context("Main", &monitor).await?;

    let old = context.open_session(SessionPurpose::UserQuery, "long running", &monitor)?;
    context.invalidate_full(&monitor).await?;

    assert!(old.is_stale());
    let err = old.fetch_count("SELECT 1").await.unwrap_err();
    assert!(err.is_connection_error());

    let fresh = context.open_session(SessionPurpose::UserQuery, "retry", &monitor)?;
    assert_eq!(fresh.fetch_count("SELECT 1").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_pragma_variables_are_restored_after_reconnect() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let url = file_url(&dir.path().join("pragma.db"));
    let source = sqlite_source(DataSourceConfig::from_url("app", url))?;
    let monitor = ProgressMonitor::new();
    let context = source.open_context("Main", &monitor).await?;

    context
        .set_session_variable("cache_size", "1234", &monitor)
        .await?;
    let defaults = context.context_defaults().unwrap();
    assert!(!defaults.supports_schema_change);
    assert_eq!(
        defaults.session_variables.get("cache_size").map(String::as_str),
        Some("1234")
    );
    let session = context.open_session(SessionPurpose::Metadata, "pragma", &monitor)?;
    assert_eq!(session.fetch_count("PRAGMA cache_size").await?, 1234);
    drop(session);

    let outcomes = context.invalidate_full(&monitor).await?;
    assert_eq!(
        outcomes[2],
        (InvalidatePhase::AfterInvalidate, PhaseOutcome::Completed)
    );

    let session = context.open_session(SessionPurpose::Metadata, "pragma", &monitor)?;
    assert_eq!(session.fetch_count("PRAGMA cache_size").await?, 1234);
    Ok(())
}

// =============================================================================
// Read-Only Connections
// =============================================================================

#[tokio::test]
async fn test_read_only_context_rejects_writes() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.db");
    let monitor = ProgressMonitor::new();

    let writer = sqlite_source(DataSourceConfig::from_url("app", file_url(&path)))?;
    let context = writer.open_context("Writer", &monitor).await?;
    let session = context.open_session(SessionPurpose::UserScript, "seed", &monitor)?;
    session.execute("CREATE TABLE t (x INTEGER)").await?;
    session.execute("INSERT INTO t VALUES (1)").await?;
    drop(session);
    writer.disconnect().await;

    let ro_url = format!("sqlite://{}", path.display());
    let reader = sqlite_source(
        DataSourceConfig::from_url("app", ro_url.clone())
            .with_connection(ConnectionConfig::new(ro_url).with_read_only(true)),
    )?;
    let context = reader.open_context("Reader", &monitor).await?;
    let session = context.open_session(SessionPurpose::UserQuery, "read", &monitor)?;

    assert_eq!(session.fetch_count("SELECT COUNT(*) FROM t").await?, 1);
    let err = session.execute("INSERT INTO t VALUES (2)").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryExecution);
    Ok(())
}
