//! Admin API for key management
//!
//! Runs on a separate listener (default 127.0.0.1:9090) and exposes the pool's
//! administrative operations. Responses include full key values, so the
//! listener must not be published beyond operators.
//!
//! Endpoints:
//! - GET  /api/keys/status       : keys split into usable and exhausted, with counts
//! - POST /api/keys/add          : validate and add keys
//! - POST /api/keys/remove       : remove keys (never the whole pool)
//! - POST /api/keys/reset-status : zero failure counters of the given keys
//! - POST /api/keys/reset-all    : zero every failure counter
//! - POST /api/keys/verify       : live-check one key
//! - POST /api/keys/verify-batch : live-check several keys
//! - GET  /admin/pool            : pool health summary

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use key_pool::KeyManager;
use serde::Deserialize;
use tracing::info;

use crate::metrics;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<KeyManager>,
}

impl AdminState {
    pub fn new(pool: Arc<KeyManager>) -> Self {
        Self { pool }
    }
}

/// Build the admin axum router with all key management endpoints.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/api/keys/status", get(keys_status))
        .route("/api/keys/add", post(add_keys))
        .route("/api/keys/remove", post(remove_keys))
        .route("/api/keys/reset-status", post(reset_keys))
        .route("/api/keys/reset-all", post(reset_all))
        .route("/api/keys/verify", post(verify_key))
        .route("/api/keys/verify-batch", post(verify_keys))
        .route("/admin/pool", get(pool_status))
        .with_state(state)
}

/// Keys as sent by clients: a JSON array, or one string with comma or
/// newline separated entries.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeysInput {
    One(String),
    Many(Vec<String>),
}

impl KeysInput {
    /// Trimmed, non-empty entries. A string is split on commas when it has
    /// any, otherwise on newlines.
    fn normalize(self) -> Vec<String> {
        let raw: Vec<String> = match self {
            KeysInput::Many(keys) => keys,
            KeysInput::One(text) => {
                let separator = if text.contains(',') { ',' } else { '\n' };
                text.split(separator).map(str::to_string).collect()
            }
        };
        raw.into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

/// Request body for endpoints taking a list of keys.
#[derive(Deserialize)]
struct KeysRequest {
    #[serde(default)]
    keys: Option<KeysInput>,
}

impl KeysRequest {
    fn into_keys(self) -> Vec<String> {
        self.keys.map(KeysInput::normalize).unwrap_or_default()
    }
}

/// Request body for the single-key verify endpoint.
#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    key: String,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(CONTENT_TYPE, "application/json")], body.to_string())
}

fn no_keys_response() -> axum::response::Response {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "status": "error",
            "message": "no valid keys provided"
        }),
    )
    .into_response()
}

fn validity(valid: bool) -> &'static str {
    if valid { "valid" } else { "invalid" }
}

/// GET /api/keys/status: every key with its failure count, split by health.
async fn keys_status(State(state): State<AdminState>) -> impl IntoResponse {
    metrics::record_admin_request("status");
    let status = state.pool.status().await;
    metrics::record_pool_state(&status);

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "usable": status.usable,
            "exhausted": status.exhausted,
            "total": status.total(),
        }),
    )
}

/// POST /api/keys/add: validate candidates and append the accepted ones.
///
/// Keys already in the pool are reported as existing and never probed.
async fn add_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeysRequest>,
) -> axum::response::Response {
    metrics::record_admin_request("add");
    let keys = body.into_keys();
    if keys.is_empty() {
        return no_keys_response();
    }

    let outcome = state.pool.add(&keys).await;
    info!(
        added = outcome.added.len(),
        invalid = outcome.invalid.len(),
        existing = outcome.existing.len(),
        "admin add keys"
    );

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": format!(
                "{} added, {} invalid, {} already present",
                outcome.added.len(),
                outcome.invalid.len(),
                outcome.existing.len()
            ),
            "added_keys": outcome.added,
            "invalid_keys": outcome.invalid,
            "existing_keys": outcome.existing,
        }),
    )
    .into_response()
}

/// POST /api/keys/remove: drop keys and their counters.
///
/// A request naming at least as many keys as the pool holds removes nothing
/// and reports every key as not found.
async fn remove_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeysRequest>,
) -> axum::response::Response {
    metrics::record_admin_request("remove");
    let keys = body.into_keys();
    if keys.is_empty() {
        return no_keys_response();
    }

    let outcome = state.pool.remove(&keys).await;
    info!(
        removed = outcome.removed.len(),
        not_found = outcome.not_found.len(),
        "admin remove keys"
    );

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": format!(
                "{} removed, {} not found",
                outcome.removed.len(),
                outcome.not_found.len()
            ),
            "removed_keys": outcome.removed,
            "not_found_keys": outcome.not_found,
        }),
    )
    .into_response()
}

/// POST /api/keys/reset-status: zero counters for the given keys.
async fn reset_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeysRequest>,
) -> axum::response::Response {
    metrics::record_admin_request("reset");
    let keys = body.into_keys();
    if keys.is_empty() {
        return no_keys_response();
    }

    let reset = state.pool.reset(&keys).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": format!("{} keys reset", reset.len()),
            "reset_keys": reset,
        }),
    )
    .into_response()
}

/// POST /api/keys/reset-all: zero every counter in the pool.
async fn reset_all(State(state): State<AdminState>) -> impl IntoResponse {
    metrics::record_admin_request("reset_all");
    state.pool.reset_all().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "success",
            "message": "all key failure counts reset"
        }),
    )
}

/// POST /api/keys/verify: probe one key against the upstream.
async fn verify_key(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<VerifyRequest>,
) -> axum::response::Response {
    metrics::record_admin_request("verify");
    let key = body.key.trim();
    if key.is_empty() {
        return no_keys_response();
    }

    let valid = state.pool.validate(key).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "status": validity(valid) }),
    )
    .into_response()
}

/// POST /api/keys/verify-batch: probe several keys, with a summary.
async fn verify_keys(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<KeysRequest>,
) -> axum::response::Response {
    metrics::record_admin_request("verify_batch");
    let keys = body.into_keys();
    if keys.is_empty() {
        return no_keys_response();
    }

    let started = Instant::now();
    let results = state.pool.validate_many(&keys).await;
    let elapsed = started.elapsed().as_secs_f64();

    let valid = results.values().filter(|&&v| v).count();
    let rendered: BTreeMap<&str, serde_json::Value> = results
        .iter()
        .map(|(key, &ok)| (key.as_str(), serde_json::json!({ "status": validity(ok) })))
        .collect();

    info!(
        total = results.len(),
        valid,
        elapsed_secs = elapsed,
        "admin batch verification"
    );

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "results": rendered,
            "summary": {
                "total": results.len(),
                "valid": valid,
                "invalid": results.len() - valid,
                "elapsed_seconds": (elapsed * 100.0).round() / 100.0,
            }
        }),
    )
    .into_response()
}

/// GET /admin/pool: pool health summary (same shape as the health endpoint's pool fields).
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pool.health().await;
    json_response(StatusCode::OK, health)
}
