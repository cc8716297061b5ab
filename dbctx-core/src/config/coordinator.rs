//! Invalidation coordinator configuration.

use serde::{Deserialize, Serialize};

/// How the coordinator decides which contexts to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Reconnect every context that does not hold a fresh, alive link
    #[default]
    Force,
    /// Probe first; only reconnect contexts whose probe fails
    IfDead,
}

/// Configuration for invalidation runs.
///
/// Controls how many contexts are driven through their phases at once and
/// which contexts are selected for reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum number of contexts invalidated concurrently.
    ///
    /// Default: 4
    pub max_concurrency: usize,

    /// Context selection mode.
    ///
    /// Default: `Force`
    pub mode: InvalidationMode,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            mode: InvalidationMode::Force,
        }
    }
}

impl CoordinatorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum concurrency for context invalidation.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the context selection mode.
    pub fn with_mode(mut self, mode: InvalidationMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.mode, InvalidationMode::Force);
    }

    #[test]
    fn test_coordinator_config_min_concurrency() {
        let config = CoordinatorConfig::new().with_max_concurrency(0);
        assert_eq!(config.max_concurrency, 1);
    }

    #[test]
    fn test_invalidation_mode_serialization() {
        let json = serde_json::to_string(&InvalidationMode::IfDead).unwrap();
        assert_eq!(json, "\"if_dead\"");
    }
}
