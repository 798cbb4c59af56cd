//! Secret wrapper and masking for credentials
//!
//! API keys show up in admin responses on purpose, but never in logs or
//! metrics. `Secret` redacts a value in Debug/Display; `mask` renders the
//! short prefix used to tell keys apart in log lines.

use std::fmt;
use zeroize::Zeroize;

/// Number of leading characters kept by [`mask`].
const MASK_PREFIX_CHARS: usize = 5;

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

/// Render a credential for log output: first five characters, then `...`.
///
/// Counts characters, not bytes, so multi-byte input never splits mid-char.
pub fn mask(value: &str) -> String {
    let prefix: String = value.chars().take(MASK_PREFIX_CHARS).collect();
    format!("{prefix}...")
}
