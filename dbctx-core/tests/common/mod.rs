//! Scripted in-process driver and network handler for failure injection.
//!
//! The mock backend records every statement and lets tests refuse connects,
//! kill live links, fail probes, fail selected statements and slow down
//! connects or statements.

#![allow(dead_code)]

use async_trait::async_trait;
use dbctx_core::config::{ConnectionConfig, DataSourceConfig};
use dbctx_core::driver::{BackendLink, Connector, DriverDescriptor, DriverLoader, SqlDialect};
use dbctx_core::error::ContextError;
use dbctx_core::network::NetworkHandler;
use dbctx_core::{DataSource, InvalidatePhase, PhaseOutcome, ProgressMonitor, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MOCK_URL: &str = "mock://app@db.internal:5000/crm";

/// Shared script and recordings of the mock backend.
#[derive(Default)]
pub struct MockBackend {
    pub refuse_connects: AtomicBool,
    pub fail_ping: AtomicBool,
    pub connect_delay_ms: AtomicU64,
    pub statement_delay_ms: AtomicU64,
    pub connects: AtomicUsize,
    pub terminations: AtomicUsize,
    pub executed: Mutex<Vec<String>>,
    pub failing_statements: Mutex<Vec<String>>,
    pub urls: Mutex<Vec<String>>,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates a network kill of every open link.
    pub fn kill_links(&self) {
        for link in self.links.lock().unwrap().iter() {
            link.dead.store(true, Ordering::SeqCst);
        }
    }

    pub fn refuse_connects(&self, refuse: bool) {
        self.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_ping(&self, fail: bool) {
        self.fail_ping.store(fail, Ordering::SeqCst);
    }

    pub fn fail_statements_containing(&self, fragment: &str) {
        self.failing_statements
            .lock()
            .unwrap()
            .push(fragment.to_string());
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn clear_executed(&self) {
        self.executed.lock().unwrap().clear();
    }

    pub fn last_url(&self) -> Option<String> {
        self.urls.lock().unwrap().last().cloned()
    }
}

pub struct MockLink {
    backend: Arc<MockBackend>,
    dead: AtomicBool,
    terminated: AtomicBool,
}

impl MockLink {
    fn check(&self) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ContextError::network("link terminated"));
        }
        if self.dead.load(Ordering::SeqCst) {
            return Err(ContextError::network("connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendLink for MockLink {
    async fn ping(&self) -> Result<()> {
        self.check()?;
        if self.backend.fail_ping.load(Ordering::SeqCst) {
            return Err(ContextError::network("probe timed out"));
        }
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.check()?;
        let delay = self.backend.statement_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.backend.executed.lock().unwrap().push(sql.to_string());
        let failing = self
            .backend
            .failing_statements
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| sql.contains(fragment.as_str()));
        if failing {
            return Err(ContextError::QueryExecution {
                context: format!("statement rejected: {}", sql),
                source: None,
            });
        }
        Ok(0)
    }

    async fn fetch_count(&self, sql: &str) -> Result<i64> {
        self.execute(sql).await?;
        Ok(1)
    }

    async fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.backend.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

pub struct MockConnector {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl Connector for MockConnector {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Generic
    }

    async fn connect(&self, url: &str, _config: &ConnectionConfig) -> Result<Arc<dyn BackendLink>> {
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        self.backend.urls.lock().unwrap().push(url.to_string());

        let delay = self.backend.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.backend.refuse_connects.load(Ordering::SeqCst) {
            return Err(ContextError::network("connection refused"));
        }

        let link = Arc::new(MockLink {
            backend: Arc::clone(&self.backend),
            dead: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });
        self.backend.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

pub struct MockLoader {
    descriptor: DriverDescriptor,
    backend: Arc<MockBackend>,
    pub libraries_missing: AtomicBool,
    pub downloads: AtomicUsize,
    pub loads: AtomicUsize,
}

impl MockLoader {
    pub fn new(backend: Arc<MockBackend>) -> Arc<Self> {
        Arc::new(Self {
            descriptor: DriverDescriptor::custom("mock", "mock", SqlDialect::Generic),
            backend,
            libraries_missing: AtomicBool::new(false),
            downloads: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DriverLoader for MockLoader {
    fn descriptor(&self) -> &DriverDescriptor {
        &self.descriptor
    }

    fn needs_external_dependencies(&self) -> bool {
        self.libraries_missing.load(Ordering::SeqCst)
    }

    async fn download_driver_libraries(&self, _monitor: &ProgressMonitor) -> Result<Vec<PathBuf>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.libraries_missing.store(false, Ordering::SeqCst);
        Ok(vec![PathBuf::from("mock-driver.jar")])
    }

    async fn load_driver(&self, _monitor: &ProgressMonitor) -> Result<Arc<dyn Connector>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.needs_external_dependencies() {
            return Err(ContextError::driver_load("mock", "mock-driver.jar is missing"));
        }
        Ok(Arc::new(MockConnector {
            backend: Arc::clone(&self.backend),
        }))
    }
}

/// Data source config pointing at the mock backend with default schema "public".
pub fn mock_config() -> DataSourceConfig {
    DataSourceConfig::from_url("crm", MOCK_URL).with_connection(
        ConnectionConfig::new(MOCK_URL)
            .with_default_schema("public")
            .with_connect_timeout(Duration::from_secs(5))
            .with_query_timeout(Duration::from_secs(5)),
    )
}

/// Builds a data source over a fresh mock backend.
pub fn mock_source(config: DataSourceConfig) -> (Arc<DataSource>, Arc<MockBackend>, Arc<MockLoader>) {
    let backend = MockBackend::new();
    let loader = MockLoader::new(Arc::clone(&backend));
    let source = DataSource::new(config, loader.clone()).unwrap();
    (Arc::new(source), backend, loader)
}

/// Network handler that records its phases and can be told to fail one.
pub struct MockHandler {
    id: String,
    active: AtomicBool,
    pub fail_phase: Mutex<Option<InvalidatePhase>>,
    pub calls: Mutex<Vec<InvalidatePhase>>,
}

impl MockHandler {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            active: AtomicBool::new(false),
            fail_phase: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_on(&self, phase: Option<InvalidatePhase>) {
        *self.fail_phase.lock().unwrap() = phase;
    }

    pub fn calls(&self) -> Vec<InvalidatePhase> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NetworkHandler for MockHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, url: url::Url) -> Result<url::Url> {
        Ok(url)
    }

    async fn start(&self, _monitor: &ProgressMonitor) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invalidate(
        &self,
        phase: InvalidatePhase,
        _monitor: &ProgressMonitor,
    ) -> Result<PhaseOutcome> {
        self.calls.lock().unwrap().push(phase);
        if *self.fail_phase.lock().unwrap() == Some(phase) {
            return Err(ContextError::network_handler(&self.id, "tunnel host unreachable"));
        }
        match phase {
            InvalidatePhase::BeforeInvalidate => self.active.store(false, Ordering::SeqCst),
            InvalidatePhase::Invalidate => self.active.store(true, Ordering::SeqCst),
            InvalidatePhase::AfterInvalidate => {}
        }
        Ok(PhaseOutcome::Completed)
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
