//! Cooperative cancellation and deadlines for long-running operations.
//!
//! Every operation that can block on the backend (connect, session open,
//! alive probe, invalidation phases) takes a [`ProgressMonitor`]. Cancelling
//! the monitor drops the in-flight future, which releases any half-acquired
//! connection before the call returns.

use crate::{Result, error::ContextError};
use std::future::Future;
use std::time::Duration;

/// Cancellation signal passed down to long-running operations.
pub type ProgressMonitor = tokio_util::sync::CancellationToken;

/// Runs `operation` until it completes or the monitor is cancelled.
pub async fn cancellable<T, F>(monitor: &ProgressMonitor, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if monitor.is_cancelled() {
        return Err(ContextError::cancelled(operation));
    }

    tokio::select! {
        biased;
        () = monitor.cancelled() => Err(ContextError::cancelled(operation)),
        result = fut => result,
    }
}

/// Bounds `fut` by `limit`; expiry is reported as a network error.
pub async fn with_deadline<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ContextError::network(format!(
            "{} timed out after {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}
