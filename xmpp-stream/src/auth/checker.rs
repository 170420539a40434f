use core::fmt;
use std::collections::HashMap;

use super::digest_md5;

/// Reasons a credential lookup can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordError {
    /// The credentials are wrong or the account does not exist.
    AuthorizationError,
    /// The backend could not be reached, the client may retry later.
    TemporaryError,
}

impl fmt::Display for PasswordError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PasswordError::AuthorizationError => write!(fmt, "authorization error"),
            PasswordError::TemporaryError => write!(fmt, "temporary error"),
        }
    }
}

impl std::error::Error for PasswordError {}

/// Source of truth for the credentials of incoming clients.
pub trait PasswordChecker: Send + Sync {
    /// Verify a plaintext password, as sent with PLAIN.
    fn check_password(&self, username: &str, password: &str) -> Result<(), PasswordError> {
        let stored = self.get_password(username)?;
        if stored == password {
            Ok(())
        } else {
            Err(PasswordError::AuthorizationError)
        }
    }

    /// Retrieve the plaintext password of a user.
    ///
    /// Only called when [`Self::has_get_password`] returns true.
    fn get_password(&self, _username: &str) -> Result<String, PasswordError> {
        Err(PasswordError::TemporaryError)
    }

    /// Compute `H(username:realm:password)` for DIGEST-MD5.
    fn get_digest(&self, username: &str, realm: &str) -> Result<[u8; 16], PasswordError> {
        let password = self.get_password(username)?;
        Ok(digest_md5::credentials_digest(username, realm, &password))
    }

    /// Whether [`Self::get_password`] is implemented. Mechanisms which need
    /// the password itself (DIGEST-MD5) are only offered if it is.
    fn has_get_password(&self) -> bool {
        false
    }
}

/// A [`PasswordChecker`] backed by an in-memory map.
#[derive(Debug, Clone, Default)]
pub struct MemoryPasswordChecker {
    users: HashMap<String, String>,
}

impl MemoryPasswordChecker {
    /// Create an empty checker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_owned(), password.to_owned());
        self
    }
}

impl PasswordChecker for MemoryPasswordChecker {
    fn get_password(&self, username: &str) -> Result<String, PasswordError> {
        self.users
            .get(username)
            .cloned()
            .ok_or(PasswordError::AuthorizationError)
    }

    fn has_get_password(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_checker() {
        let checker = MemoryPasswordChecker::new().with_user("juliet", "r0m30");
        assert_eq!(checker.check_password("juliet", "r0m30"), Ok(()));
        assert_eq!(
            checker.check_password("juliet", "tybalt"),
            Err(PasswordError::AuthorizationError)
        );
        assert_eq!(
            checker.check_password("romeo", "r0m30"),
            Err(PasswordError::AuthorizationError)
        );
        assert!(checker.has_get_password());
    }

    struct Unreachable;

    impl PasswordChecker for Unreachable {}

    #[test]
    fn default_checker_is_temporary_failure() {
        assert_eq!(
            Unreachable.check_password("juliet", "r0m30"),
            Err(PasswordError::TemporaryError)
        );
        assert!(!Unreachable.has_get_password());
    }
}
