//! Live validation probe against the Gemini API
//!
//! A probe asks the upstream for a single output token with the candidate key
//! and reports whether the call was accepted. It bypasses the normal request
//! path on purpose: no retries, a short fixed timeout, and every failure mode
//! (non-2xx status, timeout, transport error) folds into `false`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::mask;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Gemini API root used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Cheapest model that still exercises the key.
pub const DEFAULT_VALIDATION_MODEL: &str = "gemini-1.5-flash";

/// Header carrying the API key. Keeps keys out of request URLs and access logs.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// A check that tells whether the upstream currently accepts a key.
///
/// Implementations must never panic or propagate errors; anything that is not
/// a clear acceptance is `false`. Uses `Pin<Box<dyn Future>>` so the pool can
/// hold an `Arc<dyn Probe>`.
pub trait Probe: Send + Sync {
    fn check<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Probe that calls `models/{model}:generateContent` with `maxOutputTokens = 1`.
pub struct GeminiProbe {
    client: reqwest::Client,
    endpoint: String,
}

impl GeminiProbe {
    /// Build a probe with its own HTTP client bounded by `timeout`.
    ///
    /// The same duration caps both connect and the whole request.
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build probe client: {e}")))?;
        Ok(Self::with_client(client, base_url, model))
    }

    /// Build a probe around an existing client. The client's timeouts apply.
    pub fn with_client(client: reqwest::Client, base_url: &str, model: &str) -> Self {
        let endpoint = format!(
            "{}/models/{}:generateContent",
            base_url.trim_end_matches('/'),
            model
        );
        Self { client, endpoint }
    }

    /// Full URL the probe posts to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// One-word prompt asking for a single output token.
fn probe_body() -> serde_json::Value {
    serde_json::json!({
        "contents": [{"role": "user", "parts": [{"text": "Hi"}]}],
        "generationConfig": {"maxOutputTokens": 1}
    })
}

impl Probe for GeminiProbe {
    fn check<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header(API_KEY_HEADER, key)
                .json(&probe_body())
                .send()
                .await;

            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(key = %mask(key), "probe accepted key");
                    true
                }
                Ok(response) => {
                    warn!(
                        key = %mask(key),
                        status = response.status().as_u16(),
                        "probe rejected key"
                    );
                    false
                }
                Err(e) => {
                    warn!(
                        key = %mask(key),
                        timeout = e.is_timeout(),
                        error = %e,
                        "probe request failed"
                    );
                    false
                }
            }
        })
    }
}
