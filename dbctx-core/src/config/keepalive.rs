//! Keep-alive probe configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the periodic alive-probe loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Delay between probe rounds
    #[serde(with = "super::duration_secs", rename = "interval_secs")]
    pub interval: Duration,
    /// Reconnect contexts whose probe failed
    pub auto_reconnect: bool,
    /// Include contexts left DISCONNECTED by an earlier failed invalidation
    pub retry_disconnected: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            auto_reconnect: true,
            retry_disconnected: true,
        }
    }
}

impl KeepAliveConfig {
    /// Creates a keep-alive config probing every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Sets whether failed probes trigger reconnection.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets whether disconnected contexts are retried.
    pub fn with_retry_disconnected(mut self, retry: bool) -> Self {
        self.retry_disconnected = retry;
        self
    }

    /// Validates the keep-alive settings.
    ///
    /// # Errors
    /// Returns error if the interval is zero
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval.is_zero() {
            return Err(crate::error::ContextError::configuration(
                "keep-alive interval must be greater than 0",
            ));
        }
        Ok(())
    }
}
