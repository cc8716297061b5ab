//! Data source configuration and JSON config file loading.

use super::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Driver library settings for a data source.
///
/// Native drivers need no external files; declared `libraries` are extra
/// files (extensions, client libraries) that must be present in
/// `library_dir` before a context may connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Required library file names
    pub libraries: Vec<String>,
    /// Directory the libraries are loaded from
    pub library_dir: Option<PathBuf>,
    /// Local mirror that missing libraries are copied from
    pub mirror_dir: Option<PathBuf>,
    /// Copy missing libraries from the mirror before connecting
    pub auto_download: bool,
}

/// Declarative description of a network handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkHandlerConfig {
    /// Local TCP port forward to a remote endpoint
    TcpForward {
        /// Handler identifier, unique within the data source
        id: String,
        /// Remote host the forward connects to
        remote_host: String,
        /// Remote port the forward connects to
        remote_port: u16,
        /// Preferred local port (ephemeral when absent)
        #[serde(default)]
        local_port: Option<u16>,
        /// Disabled handlers are ignored
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

fn default_enabled() -> bool {
    true
}

impl NetworkHandlerConfig {
    /// Handler identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::TcpForward { id, .. } => id,
        }
    }

    /// Whether the handler should be instantiated.
    pub fn is_enabled(&self) -> bool {
        match self {
            Self::TcpForward { enabled, .. } => *enabled,
        }
    }
}

/// Complete configuration of one data source.
///
/// # Example
/// ```rust
/// use dbctx_core::config::DataSourceConfig;
///
/// let config = DataSourceConfig::from_url("local", "sqlite::memory:");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceConfig {
    /// Human label of the data source
    pub name: String,
    /// Link settings shared by every context
    pub connection: ConnectionConfig,
    /// Driver library settings
    #[serde(default)]
    pub driver: DriverConfig,
    /// Transport wrappers, applied in order
    #[serde(default)]
    pub network_handlers: Vec<NetworkHandlerConfig>,
}

impl DataSourceConfig {
    /// Creates a data source config for a URL with default settings.
    pub fn from_url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: ConnectionConfig::new(url),
            driver: DriverConfig::default(),
            network_handlers: Vec::new(),
        }
    }

    /// Builder method to replace the connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Builder method to replace the driver settings.
    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    /// Builder method to add a network handler.
    pub fn with_network_handler(mut self, handler: NetworkHandlerConfig) -> Self {
        self.network_handlers.push(handler);
        self
    }

    /// Validates the data source configuration.
    ///
    /// # Errors
    /// Returns error if any part of the configuration is invalid
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(crate::error::ContextError::configuration(
                "data source name cannot be empty",
            ));
        }

        self.connection.validate()?;

        if !self.driver.libraries.is_empty() && self.driver.library_dir.is_none() {
            return Err(crate::error::ContextError::configuration(
                "driver.library_dir is required when driver.libraries are declared",
            ));
        }

        if self.driver.auto_download && self.driver.mirror_dir.is_none() {
            return Err(crate::error::ContextError::configuration(
                "driver.mirror_dir is required when driver.auto_download is enabled",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for handler in &self.network_handlers {
            if !seen.insert(handler.id()) {
                return Err(crate::error::ContextError::configuration(format!(
                    "duplicate network handler id '{}'",
                    handler.id()
                )));
            }
            match handler {
                NetworkHandlerConfig::TcpForward {
                    remote_host,
                    remote_port,
                    ..
                } => {
                    if remote_host.is_empty() || *remote_port == 0 {
                        return Err(crate::error::ContextError::configuration(format!(
                            "network handler '{}' needs a remote host and a non-zero port",
                            handler.id()
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Loads and validates a data source config from a JSON file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated
    pub async fn load(path: &Path) -> crate::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| crate::error::ContextError::Io {
                context: format!("Failed to read {}", path.display()),
                source: e,
            })?;

        let config: Self =
            serde_json::from_str(&raw).map_err(|e| crate::error::ContextError::Serialization {
                context: format!("Failed to parse {}", path.display()),
                source: e,
            })?;

        config.validate()?;
        Ok(config)
    }
}
