//! Secure credential container with automatic memory zeroing.
//!
//! # Security
//! - Credentials are stored in `Zeroizing<T>` containers
//! - Memory is automatically cleared when credentials go out of scope
//! - Passwords are never exposed in debug output or logs

use zeroize::{Zeroize, Zeroizing};

/// Secure credential container that automatically zeros memory on drop.
///
/// # Example
///
/// ```rust
/// use dbctx_core::security::Credentials;
///
/// let creds = Credentials::new("admin".to_string(), Some("secret".to_string()));
/// assert_eq!(creds.username(), "admin");
/// assert!(creds.has_password());
/// assert!(!format!("{creds:?}").contains("secret"));
/// ```
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Credentials {
    username: Zeroizing<String>,
    password: Zeroizing<Option<String>>,
}

impl Credentials {
    /// Creates new credentials with automatic memory zeroing.
    pub fn new(username: String, password: Option<String>) -> Self {
        Self {
            username: Zeroizing::new(username),
            password: Zeroizing::new(password),
        }
    }

    /// Gets the username (still protected by Zeroizing).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Checks if password is present without exposing it.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Borrows the password for the duration of a connect call.
    pub(crate) fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Returns these credentials with the password replaced, when one is given.
    pub fn with_password_override(self, password: Option<&str>) -> Self {
        match password {
            Some(password) => Self::new(
                self.username().to_string(),
                Some(password.to_string()),
            ),
            None => self,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username())
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_new() {
        let creds = Credentials::new("testuser".to_string(), Some("testpass".to_string()));
        assert_eq!(creds.username(), "testuser");
        assert!(creds.has_password());
        assert_eq!(creds.password(), Some("testpass"));
    }

    #[test]
    fn test_credentials_no_password() {
        let creds = Credentials::new("testuser".to_string(), None);
        assert!(!creds.has_password());
        assert_eq!(creds.password(), None);
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let creds = Credentials::new("user".to_string(), Some("s3cr3t".to_string()));
        let debug = format!("{:?}", creds);
        assert!(debug.contains("user"));
        assert!(debug.contains("****"));
        assert!(!debug.contains("s3cr3t"));
    }

    #[test]
    fn test_credentials_password_override() {
        let creds = Credentials::new("user".to_string(), Some("old".to_string()))
            .with_password_override(Some("new"));
        assert_eq!(creds.password(), Some("new"));

        let creds = Credentials::new("user".to_string(), None).with_password_override(None);
        assert!(!creds.has_password());
    }
}
