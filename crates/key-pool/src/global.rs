//! Process-wide pool instance
//!
//! The request path and the admin interface share one pool. The first
//! successful `initialize` establishes it; later calls return the same
//! instance and ignore their arguments.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::{KeyManager, PoolSettings};
use crate::probe::Probe;

static INSTANCE: OnceCell<Arc<KeyManager>> = OnceCell::const_new();

/// Create the process-wide pool, or return it if it already exists.
///
/// A failed construction (empty seed, bad settings) leaves no instance behind,
/// so a later call with a valid seed can still succeed.
pub async fn initialize(
    keys: Vec<String>,
    settings: PoolSettings,
    probe: Arc<dyn Probe>,
) -> Result<Arc<KeyManager>> {
    if let Some(existing) = INSTANCE.get() {
        debug!(
            ignored_keys = keys.len(),
            "key pool already initialized, ignoring seed"
        );
        return Ok(existing.clone());
    }

    INSTANCE
        .get_or_try_init(|| async move { KeyManager::new(keys, settings, probe).map(Arc::new) })
        .await
        .cloned()
}

/// The process-wide pool. Fails with `Uninitialized` before `initialize` succeeds.
pub fn instance() -> Result<Arc<KeyManager>> {
    INSTANCE.get().cloned().ok_or(Error::Uninitialized)
}
