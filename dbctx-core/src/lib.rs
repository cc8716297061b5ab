//! Execution-context lifecycle engine for database clients.
//!
//! This crate owns session acquisition, health checking and the multi-phase
//! invalidation/reconnection protocol used when a connection degrades. GUI
//! layers, SQL editors and metadata browsers sit on top of the types here.
//!
//! # Security Guarantees
//! - Credentials never appear in logs, error messages or serialized output
//! - Out-of-band passwords live in zeroizing containers
//! - Driver libraries are installed from a local mirror only; no downloads
//!
//! # Architecture
//! - [`DataSource`]: configuration, driver and network handlers; context factory
//! - [`ExecutionContext`]: one backend link, its sessions and the
//!   BEFORE/INVALIDATE/AFTER phase protocol
//! - [`InvalidationCoordinator`]: drives invalidation across contexts that
//!   share network handlers and reports a per-context outcome
//! - [`KeepAliveMonitor`]: periodic probes feeding the coordinator
//! - [`driver`]: loader gate, scheme registry and the built-in `sqlx` backends
//! - [`network`]: transport wrappers such as local TCP forwarding

pub mod config;
pub mod context;
pub mod coordinator;
pub mod datasource;
pub mod driver;
pub mod error;
pub mod keepalive;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod network;
pub mod security;

// Re-export commonly used types
pub use config::{
    ConnectionConfig, CoordinatorConfig, DataSourceConfig, InvalidationMode, KeepAliveConfig,
};
pub use context::{ExecutionContext, Session};
pub use coordinator::{ContextOutcome, InvalidationCoordinator, InvalidationReport, OutcomeStatus};
pub use datasource::DataSource;
pub use error::{ContextError, ErrorKind, Result};
pub use keepalive::KeepAliveMonitor;
pub use models::{
    ContextDefaults, ContextId, ContextSnapshot, ContextState, InvalidatePhase, PhaseOutcome,
    SessionPurpose,
};
pub use monitor::ProgressMonitor;
