//! Core data models for execution contexts and sessions.
//!
//! These types describe the observable state of the lifecycle engine. They
//! are serializable so that snapshots and invalidation reports can be written
//! out by the binary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Monotonically assigned context identifier, unique within a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connectivity state of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    /// No backend link
    Disconnected,
    /// Initial connect in progress
    Connecting,
    /// Backend link published and usable
    Connected,
    /// Between BEFORE_INVALIDATE and a successful INVALIDATE
    Invalidating,
    /// Explicitly closed; terminal
    Closed,
}

impl ContextState {
    /// Whether sessions may be opened in this state.
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Invalidating => write!(f, "INVALIDATING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Declared purpose of a session, used for diagnostics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionPurpose {
    /// Interactive query issued by a user
    UserQuery,
    /// Statement executed as part of a user script
    UserScript,
    /// Metadata introspection (catalog reads)
    Metadata,
    /// Internal utility work (keep-alive, defaults restoration)
    Utility,
}

impl std::fmt::Display for SessionPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserQuery => write!(f, "USER_QUERY"),
            Self::UserScript => write!(f, "USER_SCRIPT"),
            Self::Metadata => write!(f, "METADATA"),
            Self::Utility => write!(f, "UTILITY"),
        }
    }
}

/// One step of the three-phase invalidation protocol.
///
/// Phases are always executed in declaration order; see [`InvalidatePhase::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvalidatePhase {
    /// Terminate the current backend link
    BeforeInvalidate,
    /// Establish and publish a fresh backend link
    Invalidate,
    /// Restore defaults and session variables on the new link
    AfterInvalidate,
}

impl InvalidatePhase {
    /// All phases in execution order.
    pub const ALL: [Self; 3] = [
        Self::BeforeInvalidate,
        Self::Invalidate,
        Self::AfterInvalidate,
    ];
}

impl std::fmt::Display for InvalidatePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeInvalidate => write!(f, "BEFORE_INVALIDATE"),
            Self::Invalidate => write!(f, "INVALIDATE"),
            Self::AfterInvalidate => write!(f, "AFTER_INVALIDATE"),
        }
    }
}

/// Result of a single successful invalidation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// The phase did its work
    Completed,
    /// The phase did not apply (already done, or nothing to do for this backend)
    Skipped,
}

/// Current catalog/schema pointer and session variables of a context.
///
/// Recorded values survive invalidation: AFTER_INVALIDATE re-applies them to
/// the replacement link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextDefaults {
    /// Current default catalog (database), if any
    pub default_catalog: Option<String>,
    /// Current default schema, if any
    pub default_schema: Option<String>,
    /// Whether the backend can switch catalogs on a live link
    pub supports_catalog_change: bool,
    /// Whether the backend can switch schemas on a live link
    pub supports_schema_change: bool,
    /// Session variables re-applied after every reconnect
    pub session_variables: BTreeMap<String, String>,
}

impl ContextDefaults {
    /// Returns the default catalog name.
    pub fn default_catalog(&self) -> Option<&str> {
        self.default_catalog.as_deref()
    }

    /// Returns the default schema name.
    pub fn default_schema(&self) -> Option<&str> {
        self.default_schema.as_deref()
    }

    /// Whether anything needs re-applying on a new link.
    pub fn is_empty(&self) -> bool {
        self.default_catalog.is_none()
            && self.default_schema.is_none()
            && self.session_variables.is_empty()
    }
}

/// Point-in-time view of a context, for diagnostics output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    /// Context identifier
    pub id: ContextId,
    /// Human label
    pub name: String,
    /// Owning data source name
    pub data_source: String,
    /// Connectivity state
    pub state: ContextState,
    /// Number of backend links published so far
    pub generation: u64,
    /// Sessions not yet released
    pub open_sessions: usize,
    /// Recorded defaults
    pub defaults: ContextDefaults,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phases = InvalidatePhase::ALL.to_vec();
        phases.reverse();
        phases.sort();
        assert_eq!(phases, InvalidatePhase::ALL.to_vec());
        assert_eq!(InvalidatePhase::ALL[0], InvalidatePhase::BeforeInvalidate);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&InvalidatePhase::AfterInvalidate).unwrap();
        assert_eq!(json, "\"AFTER_INVALIDATE\"");
        assert_eq!(
            InvalidatePhase::BeforeInvalidate.to_string(),
            "BEFORE_INVALIDATE"
        );
    }

    #[test]
    fn test_only_connected_state_is_connected() {
        assert!(ContextState::Connected.is_connected());
        for state in [
            ContextState::Disconnected,
            ContextState::Connecting,
            ContextState::Invalidating,
            ContextState::Closed,
        ] {
            assert!(!state.is_connected(), "{state} should not be connected");
        }
    }

    #[test]
    fn test_context_defaults_empty() {
        let mut defaults = ContextDefaults::default();
        assert!(defaults.is_empty());

        defaults
            .session_variables
            .insert("application_name".to_string(), "dbctx".to_string());
        assert!(!defaults.is_empty());
        assert_eq!(defaults.default_schema(), None);
    }

    #[test]
    fn test_context_id_display() {
        assert_eq!(ContextId(7).to_string(), "#7");
        let json = serde_json::to_string(&ContextId(7)).unwrap();
        assert_eq!(json, "7");
    }
}
