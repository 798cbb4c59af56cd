//! Key pool for upstream Gemini API credentials
//!
//! Presents a set of interchangeable API keys as one always-available
//! credential. Keys are handed out round-robin, upstream failures are counted
//! per key, and keys at or above the failure threshold are skipped until they
//! are validated again or reset by an administrator.
//!
//! Key lifecycle:
//! 1. Process start seeds the pool from configuration (`global::initialize`)
//! 2. Request path takes `next_working_key()` before each upstream call
//! 3. Upstream call fails → `report_failure(key)` bumps its counter and returns a replacement
//! 4. Counter reaches `max_failures` → key is exhausted and skipped by rotation
//! 5. Successful live validation or admin reset → counter back to zero
//! 6. Admin add (validated first) and remove mutate the pool under the rotation lock
//!
//! Nothing here fails for expected conditions: an all-exhausted pool still
//! returns a key, and rejected removals are reported in the outcome.

pub mod error;
pub mod global;
pub mod pool;
pub mod probe;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use global::{initialize, instance};
pub use pool::{AddOutcome, KeyManager, KeysByStatus, PoolSettings, RemoveOutcome};
pub use probe::{DEFAULT_BASE_URL, DEFAULT_VALIDATION_MODEL, GeminiProbe, Probe};
