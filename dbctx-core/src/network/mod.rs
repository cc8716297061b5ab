//! Transport wrappers sitting below execution contexts.
//!
//! A data source owns one [`NetworkHandlerSet`] shared by all of its
//! contexts. Handlers rewrite the connection target (a local forward port,
//! for instance) and take part in invalidation: the coordinator runs their
//! phases between the contexts' BEFORE_INVALIDATE and INVALIDATE steps.

use crate::Result;
use crate::config::NetworkHandlerConfig;
use crate::error::ContextError;
use crate::models::{InvalidatePhase, PhaseOutcome};
use crate::monitor::ProgressMonitor;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use zeroize::Zeroizing;

mod forward;

pub use forward::TcpForwardHandler;

/// A transport wrapper shared by the contexts of a data source.
#[async_trait]
pub trait NetworkHandler: Send + Sync {
    /// Handler identifier, unique within its set.
    fn id(&self) -> &str;

    /// Rewrites the connection URL so contexts go through this handler.
    fn resolve(&self, url: url::Url) -> Result<url::Url>;

    /// Brings the handler up. Starting an active handler is a no-op.
    async fn start(&self, monitor: &ProgressMonitor) -> Result<()>;

    /// Runs one invalidation phase.
    async fn invalidate(
        &self,
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> Result<PhaseOutcome>;

    /// Tears the handler down. Best-effort.
    async fn stop(&self);

    /// Whether the handler is currently up.
    fn is_active(&self) -> bool;
}

/// Ordered set of network handlers.
///
/// Handlers apply in declaration order; teardown runs in reverse.
#[derive(Default)]
pub struct NetworkHandlerSet {
    handlers: Vec<Arc<dyn NetworkHandler>>,
    disabled: RwLock<HashSet<String>>,
}

impl std::fmt::Debug for NetworkHandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkHandlerSet")
            .field("handlers", &self.ids())
            .field("disabled", &*self.disabled.read().unwrap_or_else(PoisonError::into_inner))
            .finish()
    }
}

impl NetworkHandlerSet {
    /// Creates a set from handler instances.
    pub fn new(handlers: Vec<Arc<dyn NetworkHandler>>) -> Self {
        Self {
            handlers,
            disabled: RwLock::new(HashSet::new()),
        }
    }

    /// A set with no handlers: contexts connect directly.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Instantiates the enabled handlers of a data source configuration.
    pub fn from_configs(configs: &[NetworkHandlerConfig]) -> Self {
        let handlers = configs
            .iter()
            .filter(|config| config.is_enabled())
            .map(|config| match config {
                NetworkHandlerConfig::TcpForward {
                    id,
                    remote_host,
                    remote_port,
                    local_port,
                    ..
                } => Arc::new(TcpForwardHandler::new(
                    id.clone(),
                    remote_host.clone(),
                    *remote_port,
                    *local_port,
                )) as Arc<dyn NetworkHandler>,
            })
            .collect();
        Self::new(handlers)
    }

    /// Identifiers of all handlers, in order.
    pub fn ids(&self) -> Vec<String> {
        self.handlers.iter().map(|h| h.id().to_string()).collect()
    }

    /// Whether the set contains no enabled handler.
    pub fn is_empty(&self) -> bool {
        self.active_handlers().is_empty()
    }

    /// Disables a handler so contexts bypass it from now on.
    ///
    /// Returns `false` if no handler has this id.
    pub fn disable(&self, id: &str) -> bool {
        if !self.handlers.iter().any(|h| h.id() == id) {
            return false;
        }
        tracing::warn!("Disabling network handler '{}'", id);
        self.disabled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        true
    }

    /// Whether a handler has been disabled.
    pub fn is_disabled(&self, id: &str) -> bool {
        self.disabled
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn active_handlers(&self) -> Vec<Arc<dyn NetworkHandler>> {
        let disabled = self.disabled.read().unwrap_or_else(PoisonError::into_inner);
        self.handlers
            .iter()
            .filter(|h| !disabled.contains(h.id()))
            .cloned()
            .collect()
    }

    /// Starts every enabled handler that is not already up.
    ///
    /// # Errors
    /// Returns the first handler failure as a `NetworkHandler` error
    pub async fn ensure_started(&self, monitor: &ProgressMonitor) -> Result<()> {
        for handler in self.active_handlers() {
            if !handler.is_active() {
                handler
                    .start(monitor)
                    .await
                    .map_err(|e| as_handler_error(handler.id(), e))?;
            }
        }
        Ok(())
    }

    /// Stops every handler, in reverse order.
    pub async fn stop_all(&self) {
        for handler in self.handlers.iter().rev() {
            if handler.is_active() {
                handler.stop().await;
            }
        }
    }

    /// Rewrites a connection URL through every enabled handler.
    ///
    /// # Errors
    /// Returns error if a handler is required but the target is not a
    /// host-based URL, or a handler cannot rewrite it
    pub fn resolve_url(&self, url: &str) -> Result<Zeroizing<String>> {
        let handlers = self.active_handlers();
        if handlers.is_empty() {
            return Ok(Zeroizing::new(url.to_string()));
        }

        let mut parsed = url::Url::parse(url).map_err(|e| {
            ContextError::configuration(format!(
                "Network handlers require a URL target: {}",
                e
            ))
        })?;
        if parsed.host_str().is_none() {
            return Err(ContextError::configuration(
                "Network handlers require a host-based connection URL",
            ));
        }

        for handler in handlers {
            parsed = handler
                .resolve(parsed)
                .map_err(|e| as_handler_error(handler.id(), e))?;
        }
        Ok(Zeroizing::new(parsed.to_string()))
    }

    /// Runs one invalidation phase on every enabled handler.
    ///
    /// BEFORE_INVALIDATE runs in reverse order, the other phases in order.
    /// Stops at the first failure and returns the failing handler id.
    pub async fn invalidate_all(
        &self,
        phase: InvalidatePhase,
        monitor: &ProgressMonitor,
    ) -> std::result::Result<(), (String, ContextError)> {
        let mut handlers = self.active_handlers();
        if phase == InvalidatePhase::BeforeInvalidate {
            handlers.reverse();
        }

        for handler in handlers {
            match handler.invalidate(phase, monitor).await {
                Ok(outcome) => {
                    tracing::debug!("Network handler '{}' {}: {:?}", handler.id(), phase, outcome);
                }
                Err(e) => {
                    let id = handler.id().to_string();
                    tracing::warn!("Network handler '{}' failed {}: {}", id, phase, e);
                    return Err((id.clone(), as_handler_error(&id, e)));
                }
            }
        }
        Ok(())
    }
}

/// Attributes an error to a handler unless it already is a handler error.
fn as_handler_error(id: &str, error: ContextError) -> ContextError {
    match error {
        ContextError::NetworkHandler { .. } | ContextError::Cancelled { .. } => error,
        other => ContextError::NetworkHandler {
            handler: id.to_string(),
            context: other.to_string(),
            source: Some(Box::new(other)),
        },
    }
}
