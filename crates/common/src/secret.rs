//! Secret wrapper for sensitive string values

use std::fmt;
use zeroize::Zeroize;

/// Sensitive string value - redacted in Debug/Display/logs, zeroized on drop.
///
/// Used for the admin bearer password and anywhere else a credential would
/// otherwise sit in a plain `String`.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Constant-length-agnostic equality against a candidate value.
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_debug_and_display() {
        let secret = SecretString::new("my-api-password");
        assert_eq!(format!("{secret:?}"), "[REDACTED]");
        assert_eq!(format!("{secret}"), "[REDACTED]");
    }

    #[test]
    fn exposes_value() {
        let secret = SecretString::new("my-api-password");
        assert_eq!(secret.expose(), "my-api-password");
    }

    #[test]
    fn matches_candidate() {
        let secret = SecretString::new("sk-123456");
        assert!(secret.matches("sk-123456"));
        assert!(!secret.matches("sk-000000"));
        assert!(!secret.matches(""));
    }

    #[test]
    fn clone_is_independent() {
        let secret = SecretString::new("clone-me");
        let cloned = secret.clone();
        drop(secret);
        assert_eq!(cloned.expose(), "clone-me");
    }
}
