//! Data sources: configuration, driver and network handlers shared by a
//! family of execution contexts.

use crate::Result;
use crate::config::{ConnectionConfig, DataSourceConfig};
use crate::context::ExecutionContext;
use crate::coordinator::{InvalidationCoordinator, InvalidationReport};
use crate::driver::{Connector, DriverLoader, DriverRegistry};
use crate::error::ContextError;
use crate::models::ContextId;
use crate::monitor::ProgressMonitor;
use crate::network::NetworkHandlerSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::OnceCell;

/// Factory and owner of the execution contexts of one logical connection.
///
/// # Example
/// ```rust,no_run
/// use dbctx_core::config::DataSourceConfig;
/// use dbctx_core::driver::DriverRegistry;
/// use dbctx_core::models::SessionPurpose;
/// use dbctx_core::{DataSource, ProgressMonitor};
///
/// # async fn example() -> dbctx_core::Result<()> {
/// let registry = DriverRegistry::with_builtin_drivers();
/// let source = DataSource::from_registry(
///     DataSourceConfig::from_url("local", "sqlite::memory:"),
///     &registry,
/// )?;
///
/// let monitor = ProgressMonitor::new();
/// let context = source.open_context("Metadata", &monitor).await?;
/// let session = context.open_session(SessionPurpose::Metadata, "list tables", &monitor)?;
/// session.fetch_count("SELECT count(*) FROM sqlite_master").await?;
/// # Ok(())
/// # }
/// ```
pub struct DataSource {
    config: DataSourceConfig,
    connection: Arc<ConnectionConfig>,
    loader: Arc<dyn DriverLoader>,
    network: Arc<NetworkHandlerSet>,
    connector: OnceCell<Arc<dyn Connector>>,
    contexts: RwLock<Vec<Arc<ExecutionContext>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.config.name)
            .field("target", &self.connection.target())
            .field("driver", &self.loader.descriptor().name)
            .field("contexts", &self.contexts().len())
            .finish()
    }
}

impl DataSource {
    /// Creates a data source with an explicit driver loader.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn new(config: DataSourceConfig, loader: Arc<dyn DriverLoader>) -> Result<Self> {
        config.validate()?;
        let network = Arc::new(NetworkHandlerSet::from_configs(&config.network_handlers));
        Ok(Self {
            connection: Arc::new(config.connection.clone()),
            config,
            loader,
            network,
            connector: OnceCell::new(),
            contexts: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Creates a data source, resolving its driver through `registry`.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or no driver serves the
    /// URL scheme
    pub fn from_registry(config: DataSourceConfig, registry: &DriverRegistry) -> Result<Self> {
        let loader = registry.resolve(&config)?;
        Self::new(config, loader)
    }

    /// Replaces the network handlers built from the configuration.
    pub fn with_network(mut self, network: Arc<NetworkHandlerSet>) -> Self {
        self.network = network;
        self
    }

    /// Data source name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Full configuration.
    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Network handlers shared by every context.
    pub fn network(&self) -> &Arc<NetworkHandlerSet> {
        &self.network
    }

    /// Driver loader of this data source.
    pub fn loader(&self) -> &Arc<dyn DriverLoader> {
        &self.loader
    }

    /// Loads the driver once, fetching libraries first when allowed.
    ///
    /// # Errors
    /// Returns `DriverLoad` when libraries are missing and auto-download is
    /// off, or when the loader fails
    pub async fn ensure_driver(&self, monitor: &ProgressMonitor) -> Result<Arc<dyn Connector>> {
        let connector = self
            .connector
            .get_or_try_init(|| async {
                let driver = self.loader.descriptor().name.clone();
                if self.loader.needs_external_dependencies() {
                    if !self.config.driver.auto_download {
                        return Err(ContextError::driver_load(
                            driver,
                            "required libraries are missing and auto_download is disabled",
                        ));
                    }
                    let installed = self.loader.download_driver_libraries(monitor).await?;
                    tracing::info!("Installed {} library file(s) for {}", installed.len(), driver);
                }
                let connector = self.loader.load_driver(monitor).await?;
                tracing::info!("Driver {} loaded for '{}'", driver, self.config.name);
                Ok(connector)
            })
            .await?;
        Ok(Arc::clone(connector))
    }

    /// Creates a new, `DISCONNECTED` context.
    ///
    /// # Errors
    /// Returns `DriverLoad` if the driver cannot be loaded
    pub async fn new_context(
        &self,
        name: impl Into<String>,
        monitor: &ProgressMonitor,
    ) -> Result<Arc<ExecutionContext>> {
        let connector = self.ensure_driver(monitor).await?;
        let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst).saturating_add(1));
        let context = Arc::new(ExecutionContext::new(
            id,
            name,
            self.config.name.clone(),
            Arc::clone(&self.connection),
            connector,
            Arc::clone(&self.network),
        ));
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&context));
        tracing::debug!("Created context {} '{}' on '{}'", id, context.name(), self.config.name);
        Ok(context)
    }

    /// Creates a context and connects it.
    ///
    /// # Errors
    /// Returns the driver or connect failure; a context that failed to
    /// connect is discarded
    pub async fn open_context(
        &self,
        name: impl Into<String>,
        monitor: &ProgressMonitor,
    ) -> Result<Arc<ExecutionContext>> {
        let context = self.new_context(name, monitor).await?;
        if let Err(e) = context.connect(monitor).await {
            self.remove(context.id());
            context.close().await;
            return Err(e);
        }
        Ok(context)
    }

    /// All live contexts, in creation order.
    pub fn contexts(&self) -> Vec<Arc<ExecutionContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Looks up a context by id.
    pub fn context(&self, id: ContextId) -> Option<Arc<ExecutionContext>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    fn remove(&self, id: ContextId) -> Option<Arc<ExecutionContext>> {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        let index = contexts.iter().position(|c| c.id() == id)?;
        Some(contexts.remove(index))
    }

    /// Closes and forgets a context. Returns `false` for unknown ids.
    pub async fn close_context(&self, id: ContextId) -> bool {
        match self.remove(id) {
            Some(context) => {
                context.close().await;
                true
            }
            None => false,
        }
    }

    /// Whether any context currently has a usable link.
    pub fn is_connected(&self) -> bool {
        self.contexts().iter().any(|c| c.is_connected())
    }

    /// Closes every context and stops the network handlers.
    pub async fn disconnect(&self) {
        let contexts: Vec<_> = std::mem::take(
            &mut *self.contexts.write().unwrap_or_else(PoisonError::into_inner),
        );
        for context in &contexts {
            context.close().await;
        }
        self.network.stop_all().await;
        tracing::info!(
            "Disconnected '{}' ({} context(s) closed)",
            self.config.name,
            contexts.len()
        );
    }

    /// Invalidates every context of this data source.
    pub async fn invalidate(
        &self,
        coordinator: &InvalidationCoordinator,
        monitor: &ProgressMonitor,
    ) -> InvalidationReport {
        coordinator
            .invalidate(self.name(), &self.contexts(), &self.network, monitor)
            .await
    }
}
