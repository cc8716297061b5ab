//! Sessions: units of work bound to one backend link generation.

use crate::Result;
use crate::driver::BackendLink;
use crate::error::ContextError;
use crate::models::{ContextId, SessionPurpose};
use crate::monitor::with_deadline;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// A unit of work opened from an [`ExecutionContext`](super::ExecutionContext).
///
/// The session stays bound to the link that was current when it was opened.
/// Once the context publishes a new link the session is stale and every
/// statement fails with a network error instead of running on the new link.
///
/// Dropping the session releases it; the context's open-session count is
/// decremented on every exit path.
pub struct Session {
    context_id: ContextId,
    context_name: String,
    purpose: SessionPurpose,
    task: String,
    link: Arc<dyn BackendLink>,
    generation: u64,
    current_generation: Arc<AtomicU64>,
    open_sessions: Arc<AtomicUsize>,
    query_timeout: Duration,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        context_id: ContextId,
        context_name: String,
        purpose: SessionPurpose,
        task: String,
        link: Arc<dyn BackendLink>,
        generation: u64,
        current_generation: Arc<AtomicU64>,
        open_sessions: Arc<AtomicUsize>,
        query_timeout: Duration,
    ) -> Self {
        open_sessions.fetch_add(1, Ordering::SeqCst);
        Self {
            context_id,
            context_name,
            purpose,
            task,
            link,
            generation,
            current_generation,
            open_sessions,
            query_timeout,
        }
    }

    /// Identifier of the owning context.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Declared purpose.
    pub fn purpose(&self) -> SessionPurpose {
        self.purpose
    }

    /// Task description, with credentials scrubbed.
    pub fn task(&self) -> &str {
        &self.task
    }

    /// Link generation the session is bound to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the context has replaced or terminated the link since opening.
    pub fn is_stale(&self) -> bool {
        self.current_generation.load(Ordering::SeqCst) != self.generation
            || self.link.is_terminated()
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.is_stale() {
            return Err(ContextError::network(format!(
                "Session of '{}' is bound to a replaced backend link (generation {})",
                self.context_name, self.generation
            )));
        }
        Ok(())
    }

    /// Executes a statement, returning the number of affected rows.
    ///
    /// # Errors
    /// Returns a network error if the session is stale or the link fails,
    /// or a query error if the backend rejects the statement
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_fresh()?;
        with_deadline(self.query_timeout, "statement", self.link.execute(sql)).await
    }

    /// Runs a single-value query, returning the first column of the first row.
    ///
    /// # Errors
    /// Same as [`Session::execute`]
    pub async fn fetch_count(&self, sql: &str) -> Result<i64> {
        self.ensure_fresh()?;
        with_deadline(self.query_timeout, "query", self.link.fetch_count(sql)).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context_id)
            .field("purpose", &self.purpose)
            .field("task", &self.task)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(
            "Released {} session on '{}' ({})",
            self.purpose,
            self.context_name,
            self.task
        );
    }
}
