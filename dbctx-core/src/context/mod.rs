//! Execution contexts: named connection scopes with a three-phase
//! invalidation protocol.
//!
//! # State Machine
//! ```text
//! DISCONNECTED -> CONNECTING -> CONNECTED -> INVALIDATING -> CONNECTED
//!                                                         \-> DISCONNECTED
//! any state -> CLOSED (terminal)
//! ```
//!
//! # Locking
//! - The link state lives behind a short-lived `RwLock` that is never held
//!   across an await point. `open_session` and `is_connected` only touch it.
//! - Alive checks, invalidation phases and defaults changes serialize on a
//!   per-context async lifecycle lock. Other contexts are never blocked.
//! - A new link is published together with the `CONNECTED` state in one
//!   write, so readers never observe a half-replaced link.

use crate::Result;
use crate::config::ConnectionConfig;
use crate::driver::{BackendLink, Connector, SqlDialect};
use crate::error::ContextError;
use crate::models::{
    ContextDefaults, ContextId, ContextSnapshot, ContextState, InvalidatePhase, PhaseOutcome,
    SessionPurpose,
};
use crate::monitor::{ProgressMonitor, cancellable, with_deadline};
use crate::network::NetworkHandlerSet;
use crate::security::{ValidationPatterns, scrub_credentials};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

mod session;

pub use session::Session;

#[derive(Debug, Clone, Copy)]
enum Publish {
    /// First link after `connect`; defaults were already applied
    Connect,
    /// Replacement link from INVALIDATE; AFTER restores defaults
    Reconnect,
}

struct LinkState {
    state: ContextState,
    link: Option<Arc<dyn BackendLink>>,
    /// Set when INVALIDATE publishes a link, cleared by use, a failed
    /// probe or a failed liveness recheck
    fresh: bool,
    /// Generation whose defaults have been applied
    restored_generation: u64,
}

/// A nameable connection scope owning one backend link and its sessions.
pub struct ExecutionContext {
    id: ContextId,
    name: String,
    data_source: String,
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    network: Arc<NetworkHandlerSet>,
    link: RwLock<LinkState>,
    defaults: RwLock<ContextDefaults>,
    lifecycle: tokio::sync::Mutex<()>,
    generation: Arc<AtomicU64>,
    open_sessions: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("data_source", &self.data_source)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl ExecutionContext {
    pub(crate) fn new(
        id: ContextId,
        name: impl Into<String>,
        data_source: impl Into<String>,
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        network: Arc<NetworkHandlerSet>,
    ) -> Self {
        let dialect = connector.dialect();
        let defaults = ContextDefaults {
            default_catalog: config.default_catalog.clone(),
            default_schema: config.default_schema.clone(),
            supports_catalog_change: dialect.supports_catalog_change(),
            supports_schema_change: dialect.supports_schema_change(),
            session_variables: config.session_variables.clone(),
        };

        Self {
            id,
            name: name.into(),
            data_source: data_source.into(),
            config,
            connector,
            network,
            link: RwLock::new(LinkState {
                state: ContextState::Disconnected,
                link: None,
                fresh: false,
                restored_generation: 0,
            }),
            defaults: RwLock::new(defaults),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: Arc::new(AtomicU64::new(0)),
            open_sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Context identifier.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Human label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning data source.
    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// SQL dialect of the backend.
    pub fn dialect(&self) -> SqlDialect {
        self.connector.dialect()
    }

    /// Current connectivity state.
    pub fn state(&self) -> ContextState {
        self.read_link().state
    }

    /// Whether this context's own link is published and usable.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the current link was published by the last invalidation and
    /// has not been used or found dead since.
    pub fn is_fresh(&self) -> bool {
        let link = self.read_link();
        link.fresh && link.state.is_connected()
    }

    /// Number of links published so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Sessions opened and not yet released.
    pub fn open_session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Current catalog/schema pointer and session variables, or `None` for
    /// backends that support neither catalogs nor schemas and have no
    /// session variables recorded.
    pub fn context_defaults(&self) -> Option<ContextDefaults> {
        let defaults = self.read_defaults();
        if !defaults.supports_catalog_change
            && !defaults.supports_schema_change
            && defaults.session_variables.is_empty()
        {
            return None;
        }
        Some(defaults.clone())
    }

    /// Point-in-time view for diagnostics.
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            id: self.id,
            name: self.name.clone(),
            data_source: self.data_source.clone(),
            state: self.state(),
            generation: self.generation(),
            open_sessions: self.open_session_count(),
            defaults: self.read_defaults().clone(),
        }
    }

    fn read_link(&self) -> std::sync::RwLockReadGuard<'_, LinkState> {
        self.link.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_link(&self) -> std::sync::RwLockWriteGuard<'_, LinkState> {
        self.link.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_defaults(&self) -> std::sync::RwLockReadGuard<'_, ContextDefaults> {
        self.defaults.read().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_lifecycle(
        &self,
        monitor: &ProgressMonitor,
    ) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        cancellable(monitor, "context lifecycle lock", async {
            Ok(self.lifecycle.lock().await)
        })
        .await
    }

    /// Opens the backend link: `DISCONNECTED -> CONNECTING -> CONNECTED`.
    ///
    /// Configured defaults are applied to the new link before it is
    /// published, so the context stays `CONNECTING` until sessions can see
    /// the restored catalog, schema and session variables. Connecting a
    /// connected context is a no-op.
    ///
    /// # Errors
    /// Returns the connect or defaults failure; the context is left
    /// `DISCONNECTED`. A closed context returns `Closed`.
    pub async fn connect(&self, monitor: &ProgressMonitor) -> Result<()> {
        let _lifecycle = self.lock_lifecycle(monitor).await?;

        {
            let mut link = self.write_link();
            match link.state {
                ContextState::Closed => return Err(ContextError::closed(&self.name)),
                ContextState::Connected => return Ok(()),
                ContextState::Disconnected
                | ContextState::Connecting
                | ContextState::Invalidating => link.state = ContextState::Connecting,
            }
        }

        tracing::info!(
            "Connecting context '{}' of '{}' to {}",
            self.name,
            self.data_source,
            self.config.target()
        );

        let result = async {
            let new_link = self.open_link(monitor).await?;
            if let Err(e) = self.apply_defaults(&new_link, monitor).await {
                new_link.terminate().await;
                return Err(e);
            }
            self.publish_link(new_link, Publish::Connect).await
        }
        .await;

        match result {
            Ok(_) => {
                tracing::info!("Context '{}' connected", self.name);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Context '{}' failed to connect: {}", self.name, e);
                self.drop_link().await;
                Err(e)
            }
        }
    }

    /// Opens a session on the current link.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the context is `CONNECTED`, `Closed` for
    /// a closed context and `Cancelled` if the monitor is already cancelled
    pub fn open_session(
        &self,
        purpose: SessionPurpose,
        task: &str,
        monitor: &ProgressMonitor,
    ) -> Result<Session> {
        if monitor.is_cancelled() {
            return Err(ContextError::cancelled("open session"));
        }

        let (link, generation) = {
            let mut state = self.write_link();
            match (state.state, state.link.clone()) {
                (ContextState::Connected, Some(link)) => {
                    state.fresh = false;
                    (link, self.generation.load(Ordering::SeqCst))
                }
                (ContextState::Closed, _) => return Err(ContextError::closed(&self.name)),
                (current, _) => return Err(ContextError::not_connected(&self.name, current)),
            }
        };

        let task = scrub_credentials(task);
        tracing::debug!(
            "Opening {} session on '{}' (generation {}): {}",
            purpose,
            self.name,
            generation,
            task
        );

        Ok(Session::new(
            self.id,
            self.name.clone(),
            purpose,
            task,
            link,
            generation,
            Arc::clone(&self.generation),
            Arc::clone(&self.open_sessions),
            self.config.query_timeout,
        ))
    }

    /// Round-trip no-op against the backend.
    ///
    /// Never changes connectivity state. A failed probe marks the link as
    /// suspect so that the next invalidation really reconnects.
    ///
    /// # Errors
    /// Returns a network error if the round trip fails or exceeds the query
    /// timeout, `NotConnected` if there is no link to probe
    pub async fn check_context_alive(&self, monitor: &ProgressMonitor) -> Result<()> {
        let _lifecycle = self.lock_lifecycle(monitor).await?;

        let (link, generation) = {
            let state = self.read_link();
            match (state.state, state.link.clone()) {
                (ContextState::Connected, Some(link)) => {
                    (link, self.generation.load(Ordering::SeqCst))
                }
                (ContextState::Closed, _) => return Err(ContextError::closed(&self.name)),
                (current, _) => return Err(ContextError::not_connected(&self.name, current)),
            }
        };

        let probe = with_deadline(self.config.query_timeout, "alive check", link.ping());
        match cancellable(monitor, "alive check", probe).await {
            Ok(()) => Ok(()),
            Err(e @ ContextError::Cancelled { .. }) => Err(e),
            Err(e) => {
                tracing::warn!("Alive check failed for '{}': {}", self.name, e);
                {
                    let mut state = self.write_link();
                    if self.generation.load(Ordering::SeqCst) == generation {
                        state.fresh = false;
                    }
                }
                match e {
                    network @ ContextError::Network { .. } => Err(network),
                    other => Err(ContextError::network_failed(
                        format!("Alive check failed for '{}'", self.name),
                        other,
                    )),
                }
            }
        }
    }

    /// Runs a single invalidation phase.
    ///
    /// Phases must be invoked in [`InvalidatePhase::ALL`] order. BEFORE and
    /// INVALIDATE are skipped for a fresh link that still answers a ping,
    /// AFTER is skipped once the defaults of the current link are restored.
    ///
    /// # Errors
    /// Returns `Invalidate { phase, source }`; the context is left
    /// `DISCONNECTED`
    pub async fn invalidate_context(
        &self,
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> Result<PhaseOutcome> {
        let _lifecycle = self
            .lock_lifecycle(monitor)
            .await
            .map_err(|e| ContextError::invalidate(phase, e))?;
        self.run_phase(phase, monitor).await
    }

    /// Runs all three phases in order, stopping at the first failure.
    ///
    /// The lifecycle lock is held for the whole sequence, so no alive check
    /// interleaves with it.
    ///
    /// # Errors
    /// Returns the first failing phase's `Invalidate` error; later phases
    /// are not invoked
    pub async fn invalidate_full(
        &self,
        monitor: &ProgressMonitor,
    ) -> Result<Vec<(InvalidatePhase, PhaseOutcome)>> {
        let _lifecycle = self
            .lock_lifecycle(monitor)
            .await
            .map_err(|e| ContextError::invalidate(InvalidatePhase::BeforeInvalidate, e))?;

        let mut outcomes = Vec::with_capacity(InvalidatePhase::ALL.len());
        for phase in InvalidatePhase::ALL {
            let outcome = self.run_phase(phase, monitor).await?;
            outcomes.push((phase, outcome));
        }
        Ok(outcomes)
    }

    /// Runs one phase with the lifecycle lock held.
    async fn run_phase(
        &self,
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> Result<PhaseOutcome> {
        if self.state() == ContextState::Closed {
            return Err(ContextError::invalidate(
                phase,
                ContextError::closed(&self.name),
            ));
        }

        let result = if monitor.is_cancelled() {
            Err(ContextError::cancelled(format!("{} of '{}'", phase, self.name)))
        } else {
            match phase {
                InvalidatePhase::BeforeInvalidate => self.before_invalidate(monitor).await,
                InvalidatePhase::Invalidate => self.reconnect(monitor).await,
                InvalidatePhase::AfterInvalidate => self.after_invalidate(monitor).await,
            }
        };

        match result {
            Ok(outcome) => {
                tracing::debug!("Context '{}' {}: {:?}", self.name, phase, outcome);
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Context '{}' failed {}: {}", self.name, phase, e);
                self.drop_link().await;
                Err(ContextError::invalidate(phase, e))
            }
        }
    }

    /// Whether the link is fresh and still answers a ping. A fresh link
    /// that fails the ping loses its freshness. Caller holds the lifecycle
    /// lock.
    async fn still_fresh(&self, monitor: &ProgressMonitor) -> Result<bool> {
        let link = {
            let state = self.read_link();
            match (state.fresh, state.state, state.link.clone()) {
                (true, ContextState::Connected, Some(link)) => link,
                _ => return Ok(false),
            }
        };

        let probe = with_deadline(self.config.query_timeout, "liveness recheck", link.ping());
        match cancellable(monitor, "liveness recheck", probe).await {
            Ok(()) => Ok(true),
            Err(e @ ContextError::Cancelled { .. }) => Err(e),
            Err(e) => {
                tracing::debug!("Fresh link of '{}' is dead: {}", self.name, e);
                self.write_link().fresh = false;
                Ok(false)
            }
        }
    }

    async fn before_invalidate(&self, monitor: &ProgressMonitor) -> Result<PhaseOutcome> {
        if self.still_fresh(monitor).await? {
            return Ok(PhaseOutcome::Skipped);
        }

        let old = {
            let mut state = self.write_link();
            state.state = ContextState::Invalidating;
            state.fresh = false;
            state.link.take()
        };

        match old {
            Some(link) => {
                link.terminate().await;
                Ok(PhaseOutcome::Completed)
            }
            None => Ok(PhaseOutcome::Skipped),
        }
    }

    async fn reconnect(&self, monitor: &ProgressMonitor) -> Result<PhaseOutcome> {
        if self.still_fresh(monitor).await? {
            return Ok(PhaseOutcome::Skipped);
        }

        let new_link = self.open_link(monitor).await?;
        self.publish_link(new_link, Publish::Reconnect).await?;
        tracing::info!(
            "Context '{}' reconnected (generation {})",
            self.name,
            self.generation()
        );
        Ok(PhaseOutcome::Completed)
    }

    async fn after_invalidate(&self, monitor: &ProgressMonitor) -> Result<PhaseOutcome> {
        let state = self.state();
        if !state.is_connected() {
            return Err(ContextError::not_connected(&self.name, state));
        }
        self.restore_defaults(monitor).await
    }

    /// Opens a link through the network handlers, bounded by the connect timeout.
    async fn open_link(&self, monitor: &ProgressMonitor) -> Result<Arc<dyn BackendLink>> {
        self.network.ensure_started(monitor).await?;
        let url = self.network.resolve_url(&self.config.driver_url()?)?;
        let connect = with_deadline(
            self.config.connect_timeout,
            "connect",
            self.connector.connect(&url, &self.config),
        );
        cancellable(monitor, "connect", connect).await
    }

    /// Swaps `new_link` in together with the `CONNECTED` state, then
    /// terminates any link it replaced.
    async fn publish_link(&self, new_link: Arc<dyn BackendLink>, kind: Publish) -> Result<()> {
        let swapped = {
            let mut state = self.write_link();
            if state.state == ContextState::Closed {
                Err(new_link)
            } else {
                let old = state.link.replace(new_link);
                let generation = self.generation.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                state.state = ContextState::Connected;
                match kind {
                    Publish::Connect => {
                        state.fresh = false;
                        state.restored_generation = generation;
                    }
                    Publish::Reconnect => state.fresh = true,
                }
                Ok(old)
            }
        };

        match swapped {
            Ok(old) => {
                if let Some(old) = old {
                    old.terminate().await;
                }
                Ok(())
            }
            Err(rejected) => {
                rejected.terminate().await;
                Err(ContextError::closed(&self.name))
            }
        }
    }

    /// Applies recorded defaults to the current link once per generation.
    async fn restore_defaults(&self, monitor: &ProgressMonitor) -> Result<PhaseOutcome> {
        let (link, generation) = {
            let state = self.read_link();
            let generation = self.generation.load(Ordering::SeqCst);
            if state.restored_generation == generation {
                return Ok(PhaseOutcome::Skipped);
            }
            match (state.state, state.link.clone()) {
                (ContextState::Connected, Some(link)) => (link, generation),
                (current, _) => return Err(ContextError::not_connected(&self.name, current)),
            }
        };

        let applied = self.apply_defaults(&link, monitor).await?;

        {
            let mut state = self.write_link();
            if self.generation.load(Ordering::SeqCst) == generation {
                state.restored_generation = generation;
            }
        }

        if applied == 0 {
            Ok(PhaseOutcome::Skipped)
        } else {
            tracing::debug!("Restored {} default(s) on '{}'", applied, self.name);
            Ok(PhaseOutcome::Completed)
        }
    }

    /// Runs the recorded defaults on `link`; returns the statement count.
    async fn apply_defaults(
        &self,
        link: &Arc<dyn BackendLink>,
        monitor: &ProgressMonitor,
    ) -> Result<usize> {
        let defaults = self.read_defaults().clone();
        let dialect = self.dialect();
        let mut statements = Vec::new();
        if let Some(catalog) = defaults.default_catalog()
            && let Some(sql) = dialect.set_catalog_sql(catalog)
        {
            statements.push(sql);
        }
        if let Some(schema) = defaults.default_schema()
            && let Some(sql) = dialect.set_schema_sql(schema)
        {
            statements.push(sql);
        }
        for (name, value) in &defaults.session_variables {
            statements.push(dialect.set_variable_sql(name, value));
        }

        for sql in &statements {
            self.run_utility(link, sql, monitor).await?;
        }
        Ok(statements.len())
    }

    async fn run_utility(
        &self,
        link: &Arc<dyn BackendLink>,
        sql: &str,
        monitor: &ProgressMonitor,
    ) -> Result<()> {
        let statement = with_deadline(self.config.query_timeout, "utility statement", link.execute(sql));
        cancellable(monitor, "utility statement", statement).await?;
        Ok(())
    }

    /// Takes the link away and terminates it; the context becomes
    /// `DISCONNECTED` unless it is closed. Caller holds the lifecycle lock.
    async fn drop_link(&self) {
        let old = {
            let mut state = self.write_link();
            if state.state != ContextState::Closed {
                state.state = ContextState::Disconnected;
            }
            state.fresh = false;
            state.link.take()
        };
        if let Some(old) = old {
            old.terminate().await;
        }
    }

    /// Moves the context to `DISCONNECTED` after its invalidation was
    /// abandoned by the coordinator.
    pub(crate) async fn abort_invalidation(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.drop_link().await;
    }

    /// Switches the default schema on the live link and records it.
    ///
    /// # Errors
    /// Returns `UnsupportedFeature` for backends without schemas, a
    /// configuration error for invalid names, or the statement failure
    pub async fn set_default_schema(&self, schema: &str, monitor: &ProgressMonitor) -> Result<()> {
        let dialect = self.dialect();
        let sql = dialect
            .set_schema_sql(schema)
            .ok_or_else(|| ContextError::unsupported_feature("schema change", dialect.name()))?;
        self.change_default(schema, &sql, monitor, |defaults| {
            defaults.default_schema = Some(schema.to_string());
        })
        .await
    }

    /// Switches the default catalog on the live link and records it.
    ///
    /// # Errors
    /// Same as [`ExecutionContext::set_default_schema`]
    pub async fn set_default_catalog(&self, catalog: &str, monitor: &ProgressMonitor) -> Result<()> {
        let dialect = self.dialect();
        let sql = dialect
            .set_catalog_sql(catalog)
            .ok_or_else(|| ContextError::unsupported_feature("catalog change", dialect.name()))?;
        self.change_default(catalog, &sql, monitor, |defaults| {
            defaults.default_catalog = Some(catalog.to_string());
        })
        .await
    }

    /// Sets a session variable on the live link and records it for
    /// re-application after every reconnect.
    ///
    /// # Errors
    /// Returns a configuration error for invalid names, or the statement failure
    pub async fn set_session_variable(
        &self,
        name: &str,
        value: &str,
        monitor: &ProgressMonitor,
    ) -> Result<()> {
        let sql = self.dialect().set_variable_sql(name, value);
        self.change_default(name, &sql, monitor, |defaults| {
            defaults
                .session_variables
                .insert(name.to_string(), value.to_string());
        })
        .await
    }

    /// Validates `name`, runs `sql` on the live link if there is one and
    /// applies `record` before the lifecycle lock is released.
    async fn change_default(
        &self,
        name: &str,
        sql: &str,
        monitor: &ProgressMonitor,
        record: impl FnOnce(&mut ContextDefaults),
    ) -> Result<()> {
        if !ValidationPatterns::instance().is_valid_identifier(name) {
            return Err(ContextError::configuration(format!(
                "'{}' is not a valid identifier",
                name
            )));
        }

        let _lifecycle = self.lock_lifecycle(monitor).await?;
        let link = {
            let state = self.read_link();
            match (state.state, state.link.clone()) {
                (ContextState::Closed, _) => return Err(ContextError::closed(&self.name)),
                (ContextState::Connected, Some(link)) => Some(link),
                _ => None,
            }
        };

        if let Some(link) = link {
            self.run_utility(&link, sql, monitor).await?;
        }
        record(&mut *self.defaults.write().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }

    /// Closes the context and releases its link. Idempotent and terminal.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let old = {
            let mut state = self.write_link();
            if state.state == ContextState::Closed {
                return;
            }
            state.state = ContextState::Closed;
            state.fresh = false;
            state.link.take()
        };

        let open = self.open_session_count();
        if open > 0 {
            tracing::warn!(
                "Closing context '{}' with {} open session(s)",
                self.name,
                open
            );
        }
        if let Some(old) = old {
            old.terminate().await;
        }
        tracing::info!("Closed context '{}' of '{}'", self.name, self.data_source);
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let state = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.state != ContextState::Closed {
            tracing::warn!(
                "Execution context '{}' of '{}' dropped without close",
                self.name,
                self.data_source
            );
        }
    }
}
