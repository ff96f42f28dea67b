//! Extensions to the `secrecy` crate, specialized for comparable string secrets.
//!
//! Secrets received from the Forge (runner token, runtime OAuth token, job
//! secrets) flow through this type so they're never accidentally printed by
//! a `Debug` derive and so comparisons (e.g. matching a bearer token against
//! a configured value) run in constant time.

use derive_more::AsRef;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use subtle::ConstantTimeEq;

/// The literal substituted for a secret value in debug/display output.
pub const REDACTION_LITERAL: &str = "<REDACTED>";

/// [`Secret`], specialized to [`String`], with constant-time comparisons.
#[derive(Clone, AsRef, Deserialize)]
pub struct ComparableSecretString(Secret<String>);

impl ComparableSecretString {
    /// View the secret value. Callers must not log or otherwise persist the result.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ComparableSecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{REDACTION_LITERAL}")
    }
}

impl PartialEq for ComparableSecretString {
    fn eq(&self, other: &Self) -> bool {
        let lhs = self.0.expose_secret().as_bytes();
        let rhs = other.0.expose_secret().as_bytes();
        ConstantTimeEq::ct_eq(lhs, rhs).into()
    }
}

impl Eq for ComparableSecretString {}

impl From<String> for ComparableSecretString {
    fn from(value: String) -> Self {
        Self(Secret::new(value))
    }
}

impl From<&str> for ComparableSecretString {
    fn from(value: &str) -> Self {
        Self(Secret::new(value.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_secrets_compare_equal() {
        let a = ComparableSecretString::from("hunter2");
        let b = ComparableSecretString::from("hunter2");
        assert_eq!(a, b);
    }

    #[test]
    fn different_secrets_compare_unequal() {
        let a = ComparableSecretString::from("hunter2");
        let b = ComparableSecretString::from("hunter3");
        assert_ne!(a, b);
    }

    #[test]
    fn debug_never_prints_secret() {
        let secret = ComparableSecretString::from("hunter2");
        assert_eq!(format!("{secret:?}"), REDACTION_LITERAL);
    }
}
