//! Prometheus metrics exposition
//!
//! Pool metrics are emitted by `key_pool` itself:
//!
//! - `key_pool_failures_total` (counter)
//! - `key_pool_keys_exhausted_total` (counter)
//! - `key_pool_exhausted_rotations_total` (counter)
//! - `key_pool_validations_total` (counter): label `result`
//! - `key_pool_validation_duration_seconds` (histogram)
//!
//! This module installs the recorder and adds the service-level series:
//!
//! - `key_pool_keys` (gauge): label `state` (usable, exhausted)
//! - `key_proxy_admin_requests_total` (counter): label `operation`

use key_pool::KeysByStatus;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Probe latency buckets, 10ms up to the longest sensible validation timeout.
const VALIDATION_BUCKETS: &[f64] = &[0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("key_pool_validation_duration_seconds".to_string()),
            VALIDATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `key_pool_validation_duration_seconds` gets explicit buckets so it renders
/// as a histogram with `_bucket` lines rather than the default summary.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Publish the current usable/exhausted split as gauges.
pub fn record_pool_state(status: &KeysByStatus) {
    metrics::gauge!("key_pool_keys", "state" => "usable").set(status.usable.len() as f64);
    metrics::gauge!("key_pool_keys", "state" => "exhausted").set(status.exhausted.len() as f64);
}

/// Count an administrative request by operation name.
pub fn record_admin_request(operation: &'static str) {
    metrics::counter!("key_proxy_admin_requests_total", "operation" => operation).increment(1);
}
