//! Credential protection for connection strings, logs and task descriptions.
//!
//! # Security Guarantees
//! - Credentials are stored in `Zeroizing` containers for automatic memory clearing
//! - Connection URLs are split into a loggable target and zeroized credentials
//! - Free text (session task descriptions, driver messages) is scrubbed before logging
//!
//! # Module Structure
//! - `credentials`: Secure credential container with automatic memory zeroing
//! - `connection`: Connection string parsing, target description, password injection
//! - `patterns`: Pre-compiled patterns for credential scrubbing and identifier checks

mod connection;
mod credentials;
mod patterns;

pub use connection::{ConnectionTarget, describe_target, inject_password, parse_target};
pub use credentials::Credentials;
pub use patterns::{ValidationPatterns, scrub_credentials};
