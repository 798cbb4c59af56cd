//! Round-robin key rotation, failure counting and pool mutation
//!
//! Two exclusive sections guard the shared state:
//! - `rotation`: the ordered key list and its cursor. Held for every cursor
//!   step and every structural change (append, remove, rebuild).
//! - `failures`: per-key failure counters. Health checks, failure reports and
//!   resets only need this one, so they never queue behind pool mutation.
//!
//! Paths that touch both take `rotation` first, then `failures`. Validation
//! probes run outside both sections and are bounded by a semaphore instead.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use common::{Secret, mask};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::probe::Probe;

/// Failures after which a key is skipped by `next_working_key`.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Upper bound on validation probes in flight at once.
pub const DEFAULT_MAX_PARALLEL_VALIDATIONS: usize = 20;

/// Batches of this size or smaller are probed one at a time.
pub const DEFAULT_SEQUENTIAL_THRESHOLD: usize = 2;

/// Tunables for a [`KeyManager`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_failures: u32,
    pub max_parallel_validations: usize,
    pub sequential_threshold: usize,
    /// Paid-tier key handed out outside of rotation. Never counted.
    pub paid_key: Option<Secret<String>>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            max_parallel_validations: DEFAULT_MAX_PARALLEL_VALIDATIONS,
            sequential_threshold: DEFAULT_SEQUENTIAL_THRESHOLD,
            paid_key: None,
        }
    }
}

/// Result of [`KeyManager::add`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddOutcome {
    pub added: Vec<String>,
    pub invalid: Vec<String>,
    pub existing: Vec<String>,
}

/// Result of [`KeyManager::remove`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoveOutcome {
    pub removed: Vec<String>,
    pub not_found: Vec<String>,
}

/// Snapshot of every pool key with its failure count, split by health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeysByStatus {
    pub usable: BTreeMap<String, u32>,
    pub exhausted: BTreeMap<String, u32>,
}

impl KeysByStatus {
    pub fn total(&self) -> usize {
        self.usable.len() + self.exhausted.len()
    }
}

/// Ordered keys plus the index of the key handed out next.
///
/// `keys` is never empty: construction rejects an empty seed and removal
/// refuses any request that could drain the pool.
struct Rotation {
    keys: Vec<String>,
    cursor: usize,
}

impl Rotation {
    fn advance(&mut self) -> String {
        let key = self.keys[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.keys.len();
        key
    }

    /// Restart from the first key after the list changed.
    fn rebuild(&mut self) {
        self.cursor = 0;
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Trim, drop empties, and de-duplicate keeping first occurrence order.
fn normalize(keys: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}

/// Pool of interchangeable API keys shared by the request and admin paths.
pub struct KeyManager {
    rotation: Mutex<Rotation>,
    failures: RwLock<HashMap<String, u32>>,
    gate: Semaphore,
    probe: Arc<dyn Probe>,
    settings: PoolSettings,
}

impl KeyManager {
    /// Create a pool from the seed keys.
    ///
    /// Seed keys are trimmed and de-duplicated. Fails with `EmptySeed` if
    /// nothing is left, and with `InvalidSettings` for a zero failure
    /// threshold or zero validation parallelism.
    pub fn new(keys: Vec<String>, settings: PoolSettings, probe: Arc<dyn Probe>) -> Result<Self> {
        if settings.max_failures == 0 {
            return Err(Error::InvalidSettings(
                "max_failures must be greater than 0".into(),
            ));
        }
        if settings.max_parallel_validations == 0 {
            return Err(Error::InvalidSettings(
                "max_parallel_validations must be greater than 0".into(),
            ));
        }

        let keys = normalize(&keys);
        if keys.is_empty() {
            return Err(Error::EmptySeed);
        }

        let failures = keys.iter().map(|k| (k.clone(), 0)).collect();
        info!(
            keys = keys.len(),
            max_failures = settings.max_failures,
            max_parallel_validations = settings.max_parallel_validations,
            paid_key = settings.paid_key.is_some(),
            "key pool initialized"
        );
        Ok(Self {
            rotation: Mutex::new(Rotation { keys, cursor: 0 }),
            failures: RwLock::new(failures),
            gate: Semaphore::new(settings.max_parallel_validations),
            probe,
            settings,
        })
    }

    /// Failure threshold this pool was built with.
    pub fn max_failures(&self) -> u32 {
        self.settings.max_failures
    }

    /// Number of keys in the pool.
    pub async fn len(&self) -> usize {
        self.rotation.lock().await.keys.len()
    }

    /// Pool keys in rotation order.
    pub async fn keys(&self) -> Vec<String> {
        self.rotation.lock().await.keys.clone()
    }

    /// Hand out the key under the cursor and step the cursor, wrapping at the end.
    ///
    /// Ignores health. Concurrent callers are serialized, so no two calls see
    /// the same cursor position.
    pub async fn next_key(&self) -> String {
        self.rotation.lock().await.advance()
    }

    /// Whether the key's failure count is below the threshold.
    ///
    /// Keys that are not in the pool are not usable.
    pub async fn is_usable(&self, key: &str) -> bool {
        self.failures
            .read()
            .await
            .get(key)
            .is_some_and(|&count| count < self.settings.max_failures)
    }

    /// Current failure count for a key, 0 if it is not in the pool.
    pub async fn failure_count(&self, key: &str) -> u32 {
        self.failures.read().await.get(key).copied().unwrap_or(0)
    }

    /// Step through the rotation until a usable key comes up.
    ///
    /// If a full cycle finds nothing usable, the key the scan started from is
    /// returned anyway. Counters are left alone: an exhausted pool degrades to
    /// best effort instead of failing or forgetting its failure history.
    ///
    /// The scan is bounded by the pool size seen at the start, so a key
    /// removed mid-scan cannot keep it spinning.
    pub async fn next_working_key(&self) -> String {
        let initial = self.next_key().await;
        if self.is_usable(&initial).await {
            return initial;
        }

        let limit = self.len().await;
        for _ in 0..limit {
            let current = self.next_key().await;
            if current == initial {
                break;
            }
            if self.is_usable(&current).await {
                return current;
            }
        }

        debug!(
            key = %mask(&initial),
            "no usable key in a full rotation, returning starting key"
        );
        metrics::counter!("key_pool_exhausted_rotations_total").increment(1);
        initial
    }

    /// Count an upstream failure for `key` and return a replacement key.
    ///
    /// Reaching the threshold is logged and counted but changes nothing
    /// structurally; the key stays in the pool and is simply skipped. Unknown
    /// keys get no counter entry.
    pub async fn report_failure(&self, key: &str) -> String {
        {
            let mut failures = self.failures.write().await;
            match failures.get_mut(key) {
                Some(count) => {
                    *count = count.saturating_add(1);
                    metrics::counter!("key_pool_failures_total").increment(1);
                    if *count == self.settings.max_failures {
                        warn!(
                            key = %mask(key),
                            failures = *count,
                            "key reached failure threshold, marking exhausted"
                        );
                        metrics::counter!("key_pool_keys_exhausted_total").increment(1);
                    } else {
                        debug!(key = %mask(key), failures = *count, "key failure recorded");
                    }
                }
                None => {
                    warn!(key = %mask(key), "failure reported for key not in pool");
                }
            }
        }

        self.next_working_key().await
    }

    /// Probe the upstream with `key`. Never fails; anything but acceptance is `false`.
    ///
    /// Holds a gate permit for the probe's duration and no lock. On success the
    /// key's failure counter, if it has one, goes back to zero.
    pub async fn validate(&self, key: &str) -> bool {
        let valid = {
            let Ok(_permit) = self.gate.acquire().await else {
                warn!(key = %mask(key), "validation gate closed, treating key as invalid");
                return false;
            };
            let started = Instant::now();
            let valid = self.probe.check(key).await;
            metrics::histogram!("key_pool_validation_duration_seconds")
                .record(started.elapsed().as_secs_f64());
            valid
        };

        let result = if valid { "valid" } else { "invalid" };
        metrics::counter!("key_pool_validations_total", "result" => result).increment(1);

        if valid {
            info!(key = %mask(key), "key validation succeeded");
            let mut failures = self.failures.write().await;
            if let Some(count) = failures.get_mut(key) {
                if *count > 0 {
                    info!(key = %mask(key), previous = *count, "failure count reset by validation");
                }
                *count = 0;
            }
        } else {
            warn!(key = %mask(key), "key validation failed");
        }
        valid
    }

    /// Probe several keys, one result per distinct (trimmed, non-empty) key.
    ///
    /// Batches up to `sequential_threshold` run one after another; larger
    /// batches run concurrently, each probe waiting on the validation gate.
    pub async fn validate_many(&self, keys: &[String]) -> HashMap<String, bool> {
        let keys = normalize(keys);
        if keys.len() <= self.settings.sequential_threshold {
            let mut results = HashMap::with_capacity(keys.len());
            for key in keys {
                let valid = self.validate(&key).await;
                results.insert(key, valid);
            }
            return results;
        }

        info!(
            keys = keys.len(),
            max_parallel = self.settings.max_parallel_validations,
            "validating keys concurrently"
        );
        join_all(keys.into_iter().map(|key| async move {
            let valid = self.validate(&key).await;
            (key, valid)
        }))
        .await
        .into_iter()
        .collect()
    }

    /// Validate and append new keys.
    ///
    /// Keys already in the pool are reported as `existing` without probing.
    /// The rest are probed outside any lock; accepted ones are appended in
    /// input order with a zero counter, rejected ones never enter the pool.
    /// Rotation restarts only if something was appended.
    pub async fn add(&self, candidates: &[String]) -> AddOutcome {
        let mut outcome = AddOutcome::default();
        let mut to_validate = Vec::new();
        {
            let rotation = self.rotation.lock().await;
            for key in normalize(candidates) {
                if rotation.contains(&key) {
                    outcome.existing.push(key);
                } else {
                    to_validate.push(key);
                }
            }
        }

        if to_validate.is_empty() {
            info!(
                existing = outcome.existing.len(),
                "no new keys to validate"
            );
            return outcome;
        }

        info!(keys = to_validate.len(), "validating candidate keys");
        let results = self.validate_many(&to_validate).await;

        {
            let mut rotation = self.rotation.lock().await;
            let mut failures = self.failures.write().await;
            for key in to_validate {
                if !results.get(&key).copied().unwrap_or(false) {
                    warn!(key = %mask(&key), "skipping key that failed validation");
                    outcome.invalid.push(key);
                    continue;
                }
                // Another add may have appended it while we were probing
                if rotation.contains(&key) {
                    outcome.existing.push(key);
                    continue;
                }
                failures.insert(key.clone(), 0);
                rotation.keys.push(key.clone());
                info!(key = %mask(&key), "key added to pool");
                outcome.added.push(key);
            }
            if !outcome.added.is_empty() {
                rotation.rebuild();
            }
        }

        info!(
            added = outcome.added.len(),
            invalid = outcome.invalid.len(),
            existing = outcome.existing.len(),
            "add keys completed"
        );
        outcome
    }

    /// Remove keys from the pool along with their counters.
    ///
    /// Rejected wholesale, with every target reported as `not_found`, when the
    /// number of targets is at least the pool size. The check is coarse: it
    /// counts every non-empty entry as given, so unknown keys and repeats both
    /// count toward it.
    pub async fn remove(&self, targets: &[String]) -> RemoveOutcome {
        let requested: Vec<String> = targets
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        let mut rotation = self.rotation.lock().await;

        if requested.len() >= rotation.keys.len() {
            warn!(
                requested = requested.len(),
                pool = rotation.keys.len(),
                "refusing removal, at least one key must remain"
            );
            return RemoveOutcome {
                removed: Vec::new(),
                not_found: requested,
            };
        }

        let mut failures = self.failures.write().await;
        let mut outcome = RemoveOutcome::default();
        for key in normalize(&requested) {
            match rotation.keys.iter().position(|k| *k == key) {
                Some(idx) => {
                    rotation.keys.remove(idx);
                    failures.remove(&key);
                    info!(key = %mask(&key), "key removed from pool");
                    outcome.removed.push(key);
                }
                None => outcome.not_found.push(key),
            }
        }
        if !outcome.removed.is_empty() {
            rotation.rebuild();
        }

        info!(
            removed = outcome.removed.len(),
            not_found = outcome.not_found.len(),
            remaining = rotation.keys.len(),
            "remove keys completed"
        );
        outcome
    }

    /// Zero the failure counters of the given keys. Keys not in the pool are skipped.
    pub async fn reset(&self, keys: &[String]) -> Vec<String> {
        let mut failures = self.failures.write().await;
        let mut reset = Vec::new();
        for key in normalize(keys) {
            if let Some(count) = failures.get_mut(&key) {
                *count = 0;
                info!(key = %mask(&key), "key status reset");
                reset.push(key);
            }
        }
        reset
    }

    /// Zero every failure counter.
    pub async fn reset_all(&self) {
        let mut failures = self.failures.write().await;
        for count in failures.values_mut() {
            *count = 0;
        }
        info!(keys = failures.len(), "all key failure counts reset");
    }

    /// Classify every key as usable or exhausted from one consistent snapshot.
    pub async fn status(&self) -> KeysByStatus {
        let rotation = self.rotation.lock().await;
        let failures = self.failures.read().await;

        let mut status = KeysByStatus::default();
        for key in &rotation.keys {
            let count = failures.get(key).copied().unwrap_or(0);
            if count < self.settings.max_failures {
                status.usable.insert(key.clone(), count);
            } else {
                status.exhausted.insert(key.clone(), count);
            }
        }
        status
    }

    /// Pool summary for health reporting. Never includes key values.
    ///
    /// `healthy` when every key is usable, `degraded` when some are,
    /// `unhealthy` when none are.
    pub async fn health(&self) -> serde_json::Value {
        let status = self.status().await;
        let total = status.total();
        let usable = status.usable.len();

        let pool_status = if usable == total && total > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "keys_total": total,
            "keys_usable": usable,
            "keys_exhausted": status.exhausted.len(),
            "max_failures": self.settings.max_failures,
            "paid_key_configured": self.settings.paid_key.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AllowListProbe, InFlightProbe, keys};
    use std::time::Duration;

    fn settings(max_failures: u32) -> PoolSettings {
        PoolSettings {
            max_failures,
            ..PoolSettings::default()
        }
    }

    fn manager(seed: &[&str], valid: &[&str]) -> (KeyManager, Arc<AllowListProbe>) {
        let probe = Arc::new(AllowListProbe::new(valid));
        let manager = KeyManager::new(keys(seed), settings(3), probe.clone()).unwrap();
        (manager, probe)
    }

    async fn exhaust(manager: &KeyManager, key: &str) {
        for _ in 0..manager.max_failures() {
            manager.report_failure(key).await;
        }
    }

    #[test]
    fn normalize_trims_dedupes_and_drops_empty() {
        let input = keys(&[" a ", "b", "", "a", "  ", "c\n", "b"]);
        assert_eq!(normalize(&input), keys(&["a", "b", "c"]));
    }

    #[test]
    fn empty_seed_rejected() {
        let probe = Arc::new(AllowListProbe::new(&[]));
        assert!(matches!(
            KeyManager::new(vec![], PoolSettings::default(), probe.clone()),
            Err(Error::EmptySeed)
        ));
        assert!(matches!(
            KeyManager::new(keys(&["  ", ""]), PoolSettings::default(), probe),
            Err(Error::EmptySeed)
        ));
    }

    #[test]
    fn zero_thresholds_rejected() {
        let probe = Arc::new(AllowListProbe::new(&[]));
        let err = KeyManager::new(keys(&["a"]), settings(0), probe.clone())
            .err()
            .unwrap();
        assert!(err.to_string().contains("max_failures"), "got: {err}");

        let no_parallelism = PoolSettings {
            max_parallel_validations: 0,
            ..PoolSettings::default()
        };
        assert!(matches!(
            KeyManager::new(keys(&["a"]), no_parallelism, probe),
            Err(Error::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn seed_duplicates_collapse() {
        let (manager, _) = manager(&["a", "b", "a"], &[]);
        assert_eq!(manager.keys().await, keys(&["a", "b"]));
        assert_eq!(manager.status().await.total(), 2);
    }

    #[tokio::test]
    async fn next_key_is_periodic() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(manager.next_key().await);
        }
        assert_eq!(seen, keys(&["a", "b", "c", "a", "b", "c", "a"]));
    }

    #[tokio::test]
    async fn next_key_ignores_health() {
        let (manager, _) = manager(&["a", "b"], &[]);
        exhaust(&manager, "a").await;
        let first = manager.next_key().await;
        let second = manager.next_key().await;
        let mut both = vec![first, second];
        both.sort();
        assert_eq!(both, keys(&["a", "b"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_next_key_calls_are_fair() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..30 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..10 {
                    got.push(manager.next_key().await);
                }
                got
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for key in handle.await.unwrap() {
                *counts.entry(key).or_default() += 1;
            }
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[tokio::test]
    async fn threshold_boundary() {
        let (manager, _) = manager(&["a", "b"], &[]);
        for _ in 0..2 {
            manager.report_failure("a").await;
        }
        assert_eq!(manager.failure_count("a").await, 2);
        assert!(manager.is_usable("a").await, "max_failures - 1 is usable");

        manager.report_failure("a").await;
        assert_eq!(manager.failure_count("a").await, 3);
        assert!(!manager.is_usable("a").await, "max_failures is exhausted");
    }

    #[tokio::test]
    async fn unknown_key_is_not_usable() {
        let (manager, _) = manager(&["a"], &[]);
        assert!(!manager.is_usable("ghost").await);
        assert_eq!(manager.failure_count("ghost").await, 0);
    }

    #[tokio::test]
    async fn report_failure_for_unknown_key_creates_no_entry() {
        let (manager, _) = manager(&["a"], &[]);
        let replacement = manager.report_failure("ghost").await;
        assert_eq!(replacement, "a");
        assert_eq!(manager.status().await.total(), 1);
        assert!(!manager.status().await.usable.contains_key("ghost"));
    }

    #[tokio::test]
    async fn next_working_key_skips_exhausted() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        exhaust(&manager, "b").await;

        for _ in 0..9 {
            let key = manager.next_working_key().await;
            assert_ne!(key, "b");
        }
    }

    #[tokio::test]
    async fn report_failure_returns_usable_replacement() {
        let (manager, _) = manager(&["a", "b"], &[]);
        exhaust(&manager, "a").await;
        let replacement = manager.report_failure("a").await;
        assert_eq!(replacement, "b");
        assert_eq!(manager.failure_count("a").await, 4);
    }

    #[tokio::test]
    async fn all_exhausted_returns_starting_key() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        for key in ["a", "b", "c"] {
            exhaust(&manager, key).await;
        }

        let counts_before = manager.status().await;

        // Each exhausted scan consumes one full cycle plus its starting key, so
        // consecutive scans start from consecutive keys in rotation order
        let order = manager.keys().await;
        let successor = |key: &str| {
            let idx = order.iter().position(|k| k == key).unwrap();
            order[(idx + 1) % order.len()].clone()
        };

        let mut previous = manager.next_key().await;
        for _ in 0..3 {
            let expected = successor(&previous);
            let key = manager.next_working_key().await;
            assert_eq!(key, expected, "full cycle must return the key it started from");
            previous = key;
        }

        // No automatic reset on exhaustion
        assert_eq!(manager.status().await, counts_before);
        assert!(manager.status().await.usable.is_empty());
    }

    #[tokio::test]
    async fn validation_success_resets_counter() {
        let (manager, probe) = manager(&["a", "b"], &["a"]);
        exhaust(&manager, "a").await;
        assert!(!manager.is_usable("a").await);

        assert!(manager.validate("a").await);
        assert_eq!(manager.failure_count("a").await, 0);
        assert!(manager.is_usable("a").await);
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test]
    async fn validation_failure_keeps_counter() {
        let (manager, _) = manager(&["a", "b"], &[]);
        manager.report_failure("a").await;
        assert!(!manager.validate("a").await);
        assert_eq!(manager.failure_count("a").await, 1);
    }

    #[tokio::test]
    async fn validation_of_foreign_key_does_not_enter_pool() {
        let (manager, _) = manager(&["a"], &["z"]);
        assert!(manager.validate("z").await);
        assert_eq!(manager.keys().await, keys(&["a"]));
    }

    #[tokio::test]
    async fn validate_many_one_entry_per_distinct_key() {
        let (manager, probe) = manager(&["a"], &["x", "z"]);
        let results = manager
            .validate_many(&keys(&["x", "y", "z", "x", "y"]))
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results["x"], true);
        assert_eq!(results["y"], false);
        assert_eq!(results["z"], true);
        assert_eq!(probe.calls(), 3, "duplicates are probed once");
    }

    #[tokio::test]
    async fn validate_many_empty_input() {
        let (manager, probe) = manager(&["a"], &[]);
        assert!(manager.validate_many(&[]).await.is_empty());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn small_batches_run_sequentially() {
        let probe = Arc::new(InFlightProbe::new(Duration::from_millis(10)));
        let manager = KeyManager::new(keys(&["a"]), PoolSettings::default(), probe.clone()).unwrap();

        let results = manager.validate_many(&keys(&["x", "y"])).await;
        assert_eq!(results.len(), 2);
        assert_eq!(probe.peak(), 1);
    }

    #[tokio::test]
    async fn concurrent_validation_respects_gate() {
        let probe = Arc::new(InFlightProbe::new(Duration::from_millis(10)));
        let manager = KeyManager::new(keys(&["a"]), PoolSettings::default(), probe.clone()).unwrap();

        let batch: Vec<String> = (0..100).map(|i| format!("key-{i}")).collect();
        let results = manager.validate_many(&batch).await;

        assert_eq!(results.len(), 100);
        assert!(results.values().all(|&v| v));
        assert!(
            probe.peak() <= DEFAULT_MAX_PARALLEL_VALIDATIONS,
            "peak in-flight probes {} exceeded gate",
            probe.peak()
        );
        assert!(probe.peak() > 1, "large batches must run concurrently");
    }

    #[tokio::test]
    async fn gate_is_shared_across_callers() {
        let probe = Arc::new(InFlightProbe::new(Duration::from_millis(10)));
        let settings = PoolSettings {
            max_parallel_validations: 3,
            ..PoolSettings::default()
        };
        let manager = KeyManager::new(keys(&["a"]), settings, probe.clone()).unwrap();

        let first: Vec<String> = (0..10).map(|i| format!("first-{i}")).collect();
        let second: Vec<String> = (0..10).map(|i| format!("second-{i}")).collect();
        let single = manager.validate("single");
        let (a, b, _) = tokio::join!(
            manager.validate_many(&first),
            manager.validate_many(&second),
            single
        );

        assert_eq!(a.len() + b.len(), 20);
        assert!(probe.peak() <= 3, "peak {} exceeded gate of 3", probe.peak());
    }

    #[tokio::test]
    async fn add_classifies_existing_added_invalid() {
        let (manager, probe) = manager(&["A"], &["B"]);
        let outcome = manager.add(&keys(&["A", "B", "C"])).await;

        assert_eq!(outcome.added, keys(&["B"]));
        assert_eq!(outcome.invalid, keys(&["C"]));
        assert_eq!(outcome.existing, keys(&["A"]));
        assert_eq!(manager.keys().await, keys(&["A", "B"]));
        assert_eq!(manager.failure_count("B").await, 0);
        assert!(manager.is_usable("B").await);
        assert_eq!(probe.calls(), 2, "existing keys are never probed");
    }

    #[tokio::test]
    async fn add_preserves_input_order_and_rebuilds_rotation() {
        let (manager, _) = manager(&["a", "b"], &["d", "c", "e"]);
        manager.next_key().await;

        let outcome = manager.add(&keys(&["d", "c", "e"])).await;
        assert_eq!(outcome.added, keys(&["d", "c", "e"]));
        assert_eq!(manager.keys().await, keys(&["a", "b", "d", "c", "e"]));

        let mut cycle = Vec::new();
        for _ in 0..5 {
            cycle.push(manager.next_key().await);
        }
        assert_eq!(cycle, keys(&["a", "b", "d", "c", "e"]));
    }

    #[tokio::test]
    async fn add_with_nothing_valid_leaves_rotation_untouched() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        assert_eq!(manager.next_key().await, "a");

        let outcome = manager.add(&keys(&["x", "y"])).await;
        assert!(outcome.added.is_empty());
        assert_eq!(outcome.invalid, keys(&["x", "y"]));
        assert_eq!(manager.next_key().await, "b", "cursor must not restart");
    }

    #[tokio::test]
    async fn add_only_existing_skips_validation() {
        let (manager, probe) = manager(&["a", "b"], &["a", "b"]);
        let outcome = manager.add(&keys(&[" a", "b ", "", "a"])).await;
        assert_eq!(outcome.existing, keys(&["a", "b"]));
        assert!(outcome.added.is_empty());
        assert!(outcome.invalid.is_empty());
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn remove_rejects_when_targets_cover_pool() {
        let (manager, _) = manager(&["A", "B"], &[]);
        let outcome = manager.remove(&keys(&["A", "B"])).await;

        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.not_found, keys(&["A", "B"]));
        assert_eq!(manager.keys().await, keys(&["A", "B"]));
    }

    #[tokio::test]
    async fn remove_guard_counts_unknown_targets() {
        // Coarse check: two targets against a pool of two is rejected even
        // though only one of them exists
        let (manager, _) = manager(&["A", "B"], &[]);
        let outcome = manager.remove(&keys(&["A", "ghost"])).await;
        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.not_found, keys(&["A", "ghost"]));
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn remove_guard_counts_repeated_targets() {
        let (manager, _) = manager(&["A", "B"], &[]);
        let outcome = manager.remove(&keys(&["A", " A "])).await;

        assert!(outcome.removed.is_empty());
        assert_eq!(outcome.not_found, keys(&["A", "A"]));
        assert_eq!(manager.keys().await, keys(&["A", "B"]));
    }

    #[tokio::test]
    async fn remove_with_repeats_below_guard_removes_once() {
        let (manager, _) = manager(&["A", "B", "C"], &[]);
        let outcome = manager.remove(&keys(&["A", "A", ""])).await;

        assert_eq!(outcome.removed, keys(&["A"]));
        assert!(outcome.not_found.is_empty());
        assert_eq!(manager.keys().await, keys(&["B", "C"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_stays_consistent_under_mixed_load() {
        let seed: Vec<String> = (0..6).map(|i| format!("seed-{i}")).collect();
        let extra: Vec<String> = (0..8).map(|i| format!("extra-{i}")).collect();
        let extra_refs: Vec<&str> = extra.iter().map(String::as_str).collect();
        let probe = Arc::new(AllowListProbe::new(&extra_refs));
        let manager = Arc::new(KeyManager::new(seed.clone(), settings(3), probe).unwrap());

        let mut readers = Vec::new();
        for worker in 0..4 {
            let manager = manager.clone();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for i in 0..200 {
                    let key = if worker % 2 == 0 {
                        if i % 2 == 0 {
                            manager.next_key().await
                        } else {
                            manager.next_working_key().await
                        }
                    } else {
                        let key = manager.next_working_key().await;
                        manager.report_failure(&key).await
                    };
                    seen.push(key);
                    assert!(manager.len().await >= 1, "pool drained");
                    tokio::task::yield_now().await;
                }
                seen
            }));
        }

        let admin = {
            let manager = manager.clone();
            let seed = seed.clone();
            let extra = extra.clone();
            tokio::spawn(async move {
                let mut added = Vec::new();
                for (i, key) in extra.iter().enumerate() {
                    added.extend(manager.add(&[key.clone()]).await.added);
                    manager.remove(&[seed[i % seed.len()].clone()]).await;
                    if i % 3 == 0 {
                        manager.reset_all().await;
                    }
                    assert!(manager.len().await >= 1, "pool drained");
                }
                // Attempt to drain everything; the guard must refuse
                let everything = manager.keys().await;
                let outcome = manager.remove(&everything).await;
                assert!(outcome.removed.is_empty());
                added
            })
        };

        let added = admin.await.unwrap();
        let mut returned = Vec::new();
        for reader in readers {
            returned.extend(reader.await.unwrap());
        }

        let allowed: HashSet<String> = seed.iter().chain(added.iter()).cloned().collect();
        for key in &returned {
            assert!(allowed.contains(key), "returned key {key} was never in the pool");
        }

        let pool: HashSet<String> = manager.keys().await.into_iter().collect();
        let status = manager.status().await;
        let counted: HashSet<String> = status
            .usable
            .keys()
            .chain(status.exhausted.keys())
            .cloned()
            .collect();
        assert!(!pool.is_empty());
        assert_eq!(pool, counted, "keys and counters must cover the same set");
        assert_eq!(pool.len(), manager.keys().await.len(), "no duplicate keys");
        assert!(pool.is_subset(&allowed));
    }

    #[tokio::test]
    async fn remove_deletes_keys_and_counters() {
        let (manager, _) = manager(&["a", "b", "c", "d"], &[]);
        manager.report_failure("b").await;
        manager.next_key().await;

        let outcome = manager.remove(&keys(&["b", "ghost"])).await;
        assert_eq!(outcome.removed, keys(&["b"]));
        assert_eq!(outcome.not_found, keys(&["ghost"]));
        assert_eq!(manager.keys().await, keys(&["a", "c", "d"]));
        assert_eq!(manager.failure_count("b").await, 0);
        assert_eq!(manager.status().await.total(), 3);

        // Rotation restarted over the remaining keys
        let mut cycle = Vec::new();
        for _ in 0..4 {
            cycle.push(manager.next_key().await);
        }
        assert_eq!(cycle, keys(&["a", "c", "d", "a"]));
    }

    #[tokio::test]
    async fn reset_zeroes_known_keys_and_skips_unknown() {
        let (manager, _) = manager(&["a", "b"], &[]);
        exhaust(&manager, "a").await;

        let reset = manager.reset(&keys(&["a", "ghost", "a"])).await;
        assert_eq!(reset, keys(&["a"]));
        assert_eq!(manager.failure_count("a").await, 0);
        assert!(manager.is_usable("a").await);
    }

    #[tokio::test]
    async fn reset_on_usable_key_is_noop() {
        let (manager, _) = manager(&["a", "b"], &[]);
        let reset = manager.reset(&keys(&["b"])).await;
        assert_eq!(reset, keys(&["b"]));
        assert_eq!(manager.failure_count("b").await, 0);
    }

    #[tokio::test]
    async fn reset_all_clears_every_counter() {
        let (manager, _) = manager(&["a", "b"], &[]);
        exhaust(&manager, "a").await;
        manager.report_failure("b").await;

        manager.reset_all().await;
        let status = manager.status().await;
        assert!(status.exhausted.is_empty());
        assert!(status.usable.values().all(|&c| c == 0));
    }

    #[tokio::test]
    async fn status_partitions_keys_with_counts() {
        let (manager, _) = manager(&["a", "b", "c"], &[]);
        exhaust(&manager, "a").await;
        manager.report_failure("b").await;

        let status = manager.status().await;
        assert_eq!(status.exhausted.get("a"), Some(&3));
        assert_eq!(status.usable.get("b"), Some(&1));
        assert_eq!(status.usable.get("c"), Some(&0));
        assert_eq!(status.total(), 3);
    }

    #[tokio::test]
    async fn health_reflects_usable_share() {
        let (manager, _) = manager(&["a", "b"], &[]);
        assert_eq!(manager.health().await["status"], "healthy");

        exhaust(&manager, "a").await;
        let health = manager.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["keys_usable"], 1);
        assert_eq!(health["keys_exhausted"], 1);

        exhaust(&manager, "b").await;
        assert_eq!(manager.health().await["status"], "unhealthy");
        assert!(!manager.health().await.to_string().contains("\"a\""));
    }

    #[tokio::test]
    async fn paid_key_stays_out_of_rotation() {
        let probe = Arc::new(AllowListProbe::new(&[]));
        let settings = PoolSettings {
            paid_key: Some(Secret::new("paid".to_string())),
            ..PoolSettings::default()
        };
        let manager = KeyManager::new(keys(&["a"]), settings, probe).unwrap();

        assert_eq!(manager.keys().await, keys(&["a"]));
        assert_eq!(manager.next_working_key().await, "a");
        let health = manager.health().await;
        assert_eq!(health["paid_key_configured"], true);
        assert_eq!(health["keys_total"], 1);
        assert!(!health.to_string().contains("paid\""));
    }

    #[tokio::test]
    async fn failure_metrics_recorded() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let (manager, _) = manager(&["a", "b"], &["b"]);
        exhaust(&manager, "a").await;
        manager.validate("b").await;

        let output = handle.render();
        assert!(output.contains("key_pool_failures_total 3"), "got: {output}");
        assert!(output.contains("key_pool_keys_exhausted_total 1"), "got: {output}");
        assert!(output.contains("result=\"valid\""), "got: {output}");
    }
}
