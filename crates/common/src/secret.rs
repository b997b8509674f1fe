//! Secret wrapper for session keys and other sensitive values
//!
//! Session cookies are the most valuable thing the gateway holds. They are
//! redacted in every formatting path and zeroized when dropped. Operators
//! identify a key by its fingerprint (stable, derived from the value) or by a
//! masked preview, never by the value itself.

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Number of hex characters kept from the SHA-256 digest for a fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize + AsRef<str>> Secret<T> {
    /// Stable identifier derived from the secret: the first 16 hex chars of
    /// its SHA-256 digest. Equal secrets always produce equal fingerprints.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_ref().trim().as_bytes());
        let mut hex = format!("{digest:x}");
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    /// Operator-facing preview: `abcdef...wxyz` for long values, `abc***`
    /// for short ones.
    pub fn masked(&self) -> String {
        let value = self.0.as_ref();
        let chars: Vec<char> = value.chars().collect();
        if chars.len() <= 12 {
            let head: String = chars.iter().take(3).collect();
            format!("{head}***")
        } else {
            let head: String = chars[..6].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        }
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
