//! Explicit table of URL schemes to driver loaders.

use super::{DriverDescriptor, DriverLoader, NativeDriverLoader, SqlDialect};
use crate::Result;
use crate::config::DataSourceConfig;
use crate::error::ContextError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How a scheme is served.
#[derive(Clone)]
pub enum DriverEntry {
    /// Built-in `sqlx` driver, instantiated per data source
    Native(DriverDescriptor),
    /// Caller-supplied loader, shared by every data source using the scheme
    Custom(Arc<dyn DriverLoader>),
}

impl DriverEntry {
    /// Driver description.
    pub fn descriptor(&self) -> &DriverDescriptor {
        match self {
            Self::Native(descriptor) => descriptor,
            Self::Custom(loader) => loader.descriptor(),
        }
    }
}

impl std::fmt::Debug for DriverEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(descriptor) => f.debug_tuple("Native").field(&descriptor.name).finish(),
            Self::Custom(loader) => f
                .debug_tuple("Custom")
                .field(&loader.descriptor().name)
                .finish(),
        }
    }
}

/// Scheme → driver table, built once at start-up and passed down.
///
/// # Example
/// ```rust
/// use dbctx_core::driver::DriverRegistry;
///
/// let registry = DriverRegistry::with_builtin_drivers();
/// assert!(registry.entry("postgresql").is_some());
/// assert!(registry.entry("mongodb").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    entries: BTreeMap<String, DriverEntry>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with every built-in driver, compiled in or not.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register_native(DriverDescriptor {
            name: "postgresql".to_string(),
            schemes: vec!["postgres".to_string(), "postgresql".to_string()],
            dialect: SqlDialect::Postgres,
            compiled_in: cfg!(feature = "postgresql"),
            feature: Some("postgresql".to_string()),
        });
        registry.register_native(DriverDescriptor {
            name: "mysql".to_string(),
            schemes: vec!["mysql".to_string()],
            dialect: SqlDialect::MySql,
            compiled_in: cfg!(feature = "mysql"),
            feature: Some("mysql".to_string()),
        });
        registry.register_native(DriverDescriptor {
            name: "sqlite".to_string(),
            schemes: vec!["sqlite".to_string()],
            dialect: SqlDialect::Sqlite,
            compiled_in: cfg!(feature = "sqlite"),
            feature: Some("sqlite".to_string()),
        });
        registry
    }

    /// Registers a built-in driver under each of its schemes.
    pub fn register_native(&mut self, descriptor: DriverDescriptor) {
        for scheme in &descriptor.schemes {
            self.entries
                .insert(scheme.clone(), DriverEntry::Native(descriptor.clone()));
        }
    }

    /// Registers a custom loader for `scheme`, replacing any previous entry.
    pub fn register_loader(&mut self, scheme: impl Into<String>, loader: Arc<dyn DriverLoader>) {
        self.entries
            .insert(scheme.into().to_ascii_lowercase(), DriverEntry::Custom(loader));
    }

    /// Looks up a scheme.
    pub fn entry(&self, scheme: &str) -> Option<&DriverEntry> {
        self.entries.get(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes with their drivers, sorted by scheme.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &DriverEntry)> {
        self.entries.iter().map(|(scheme, entry)| (scheme.as_str(), entry))
    }

    /// Resolves the loader for a data source.
    ///
    /// # Errors
    /// Returns `DriverLoad` if no driver is registered for the URL scheme
    pub fn resolve(&self, config: &DataSourceConfig) -> Result<Arc<dyn DriverLoader>> {
        let scheme = detect_scheme(&config.connection.url)?;
        match self.entry(&scheme) {
            Some(DriverEntry::Native(descriptor)) => Ok(Arc::new(NativeDriverLoader::new(
                descriptor.clone(),
                config.driver.clone(),
            ))),
            Some(DriverEntry::Custom(loader)) => Ok(Arc::clone(loader)),
            None => Err(ContextError::driver_load(
                scheme,
                "no driver registered for this URL scheme",
            )),
        }
    }
}

/// Extracts the driver scheme from a connection URL or SQLite path.
///
/// # Errors
/// Returns a configuration error if the string has no recognizable scheme
pub fn detect_scheme(connection_string: &str) -> Result<String> {
    if connection_string == ":memory:"
        || connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        if !connection_string.contains("://") || connection_string.starts_with("sqlite:") {
            return Ok("sqlite".to_string());
        }
    }

    match connection_string.split_once(':') {
        Some((scheme, _))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            Ok(scheme.to_ascii_lowercase())
        }
        _ => Err(ContextError::configuration(
            "Unable to detect database type from connection string",
        )),
    }
}
