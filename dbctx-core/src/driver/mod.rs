//! Driver traits, loaders and the scheme registry.
//!
//! A data source resolves its URL scheme through a [`DriverRegistry`] to a
//! [`DriverLoader`]. The loader gates on external libraries and produces a
//! [`Connector`], which opens one [`BackendLink`] per execution context.
//!
//! # Object Safety
//! All traits are object-safe and used through `Arc<dyn ...>`, so custom
//! drivers (and test doubles) plug in next to the built-in `sqlx` backends.

use crate::Result;
use crate::config::ConnectionConfig;
use crate::monitor::ProgressMonitor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

mod dialect;
mod native;
mod registry;
#[cfg(any(feature = "postgresql", feature = "mysql", feature = "sqlite"))]
mod sqlx_backend;

pub use dialect::SqlDialect;
pub use native::NativeDriverLoader;
pub use registry::{DriverEntry, DriverRegistry, detect_scheme};
#[cfg(any(feature = "postgresql", feature = "mysql", feature = "sqlite"))]
pub use sqlx_backend::{SqlxConnector, SqlxLink};

/// A single dedicated connection to the backend.
///
/// Statements issued through one link are serialized by the link itself, so
/// an alive probe never interleaves with an in-flight statement.
#[async_trait]
pub trait BackendLink: Send + Sync {
    /// Round-trip no-op.
    async fn ping(&self) -> Result<()>;

    /// Executes a statement, returning the number of affected rows.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Executes a query and returns the first column of the first row.
    async fn fetch_count(&self, sql: &str) -> Result<i64>;

    /// Terminates the link. Best-effort; never fails on a dead link.
    async fn terminate(&self);

    /// Whether [`BackendLink::terminate`] has been called.
    fn is_terminated(&self) -> bool;
}

/// Opens backend links for a loaded driver.
#[async_trait]
pub trait Connector: Send + Sync {
    /// SQL dialect of links produced by this connector.
    fn dialect(&self) -> SqlDialect;

    /// Opens a new link to `url`.
    ///
    /// `url` already carries the password and any network handler rewrites.
    async fn connect(&self, url: &str, config: &ConnectionConfig) -> Result<Arc<dyn BackendLink>>;
}

/// Static description of a driver, suitable for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverDescriptor {
    /// Driver identifier ("postgresql", "sqlite", ...)
    pub name: String,
    /// URL schemes served by the driver
    pub schemes: Vec<String>,
    /// SQL dialect of the backend
    pub dialect: SqlDialect,
    /// Whether the driver was compiled into this build
    pub compiled_in: bool,
    /// Cargo feature that enables the driver
    pub feature: Option<String>,
}

impl DriverDescriptor {
    /// Creates a descriptor for a custom, always-available driver.
    pub fn custom(name: impl Into<String>, scheme: impl Into<String>, dialect: SqlDialect) -> Self {
        Self {
            name: name.into(),
            schemes: vec![scheme.into()],
            dialect,
            compiled_in: true,
            feature: None,
        }
    }
}

/// Loads a driver once its libraries are in place.
#[async_trait]
pub trait DriverLoader: Send + Sync {
    /// Driver description.
    fn descriptor(&self) -> &DriverDescriptor;

    /// Whether library files are still missing.
    fn needs_external_dependencies(&self) -> bool;

    /// Fetches missing libraries, returning the paths that were installed.
    async fn download_driver_libraries(&self, monitor: &ProgressMonitor) -> Result<Vec<PathBuf>>;

    /// Produces a connector.
    ///
    /// # Errors
    /// Returns `DriverLoad` when required libraries are absent or the driver
    /// is not compiled in
    async fn load_driver(&self, monitor: &ProgressMonitor) -> Result<Arc<dyn Connector>>;
}
