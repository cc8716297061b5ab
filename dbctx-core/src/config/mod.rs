//! Configuration types for data sources, the coordinator and keep-alive.
//!
//! - `ConnectionConfig`: Backend URL, timeouts, defaults to restore after reconnect
//! - `DataSourceConfig`: Connection plus driver library and network handler settings
//! - `CoordinatorConfig`: Invalidation parallelism and mode
//! - `KeepAliveConfig`: Alive-probe interval and reconnect policy
//!
//! # Security
//! Passwords embedded in URLs are redacted from `Debug`/`Display` output, and
//! passwords supplied separately are never serialized.

mod connection;
mod coordinator;
mod datasource;
mod keepalive;

pub use connection::ConnectionConfig;
pub use coordinator::{CoordinatorConfig, InvalidationMode};
pub use datasource::{DataSourceConfig, DriverConfig, NetworkHandlerConfig};
pub use keepalive::KeepAliveConfig;

/// Serializes `Duration` as whole seconds so JSON configs stay readable.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
