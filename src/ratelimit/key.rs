//! Admission key validation and construction.

use std::borrow::Borrow;

use crate::error::{Result, TurnstileError};

/// Longest key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// A key that identifies one independent admission budget.
///
/// Keys are opaque to the limiter. Callers usually combine an actor
/// identifier with an action name, see [`AdmissionKey::scoped`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdmissionKey(String);

impl AdmissionKey {
    /// Validate a caller-supplied key.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();

        if key.trim().is_empty() {
            return Err(TurnstileError::InvalidKey(
                "admission key must not be empty".to_string(),
            ));
        }

        if key.len() > MAX_KEY_LEN {
            return Err(TurnstileError::InvalidKey(format!(
                "admission key is {} bytes, the maximum is {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }

        Ok(Self(key))
    }

    /// Build a `"<subject>:<action>"` key.
    pub fn scoped(subject: &str, action: &str) -> Result<Self> {
        if subject.trim().is_empty() || action.trim().is_empty() {
            return Err(TurnstileError::InvalidKey(format!(
                "subject and action are both required (got '{}:{}')",
                subject, action
            )));
        }

        Self::new(format!("{}:{}", subject, action))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for AdmissionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for AdmissionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AdmissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_creation() {
        let key = AdmissionKey::new("u1:login").unwrap();
        assert_eq!(key.as_str(), "u1:login");
        assert_eq!(key.to_string(), "u1:login");
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            AdmissionKey::new(""),
            Err(TurnstileError::InvalidKey(_))
        ));
        assert!(matches!(
            AdmissionKey::new("   "),
            Err(TurnstileError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            AdmissionKey::new(key),
            Err(TurnstileError::InvalidKey(_))
        ));

        let key = "k".repeat(MAX_KEY_LEN);
        assert!(AdmissionKey::new(key).is_ok());
    }

    #[test]
    fn test_scoped_key() {
        let key = AdmissionKey::scoped("10.0.0.7", "ocr_upload").unwrap();
        assert_eq!(key.as_str(), "10.0.0.7:ocr_upload");

        assert!(AdmissionKey::scoped("", "login").is_err());
        assert!(AdmissionKey::scoped("u1", "").is_err());
    }

    #[test]
    fn test_key_equality() {
        let key1 = AdmissionKey::new("session-9:export").unwrap();
        let key2 = AdmissionKey::scoped("session-9", "export").unwrap();
        assert_eq!(key1, key2);
    }
}
