//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Pool keys come from `[pool].keys` or the API_KEYS env var (comma separated,
//! env wins). The paid key is loaded from PAID_KEY or `paid_key_file` and never
//! stored in the TOML directly.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use key_pool::PoolSettings;
use key_pool::pool::{
    DEFAULT_MAX_FAILURES, DEFAULT_MAX_PARALLEL_VALIDATIONS, DEFAULT_SEQUENTIAL_THRESHOLD,
};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Health and metrics
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Key administration. Keep this off public interfaces.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Gemini API settings used by key validation
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_validation_model")]
    pub validation_model: String,
    #[serde(default = "default_validation_timeout")]
    pub validation_timeout_secs: u64,
}

/// Key pool settings
#[derive(Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_max_parallel_validations")]
    pub max_parallel_validations: usize,
    #[serde(default = "default_sequential_threshold")]
    pub sequential_threshold: usize,
    /// Path to a file containing the paid-tier key (alternative to PAID_KEY env var)
    #[serde(default)]
    pub paid_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub paid_key: Option<Secret<String>>,
}

// Keys are credentials: print how many, not what they are
impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("keys", &self.keys.len())
            .field("max_failures", &self.max_failures)
            .field("max_parallel_validations", &self.max_parallel_validations)
            .field("sequential_threshold", &self.sequential_threshold)
            .field("paid_key_file", &self.paid_key_file)
            .field("paid_key", &self.paid_key)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            validation_model: default_validation_model(),
            validation_timeout_secs: default_validation_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            max_failures: default_max_failures(),
            max_parallel_validations: default_max_parallel_validations(),
            sequential_threshold: default_sequential_threshold(),
            paid_key_file: None,
            paid_key: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    key_pool::DEFAULT_BASE_URL.to_string()
}

fn default_validation_model() -> String {
    key_pool::DEFAULT_VALIDATION_MODEL.to_string()
}

fn default_validation_timeout() -> u64 {
    5
}

fn default_max_failures() -> u32 {
    DEFAULT_MAX_FAILURES
}

fn default_max_parallel_validations() -> usize {
    DEFAULT_MAX_PARALLEL_VALIDATIONS
}

fn default_sequential_threshold() -> usize {
    DEFAULT_SEQUENTIAL_THRESHOLD
}

/// Split a comma separated key list, dropping blanks.
fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Key resolution:
    /// 1. API_KEYS env var, if it holds at least one key
    /// 2. `[pool].keys` from the file
    ///
    /// Paid key resolution:
    /// 1. PAID_KEY env var
    /// 2. paid_key_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if config.upstream.validation_timeout_secs == 0 {
            return Err(common::Error::Config(
                "validation_timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pool.max_failures == 0 {
            return Err(common::Error::Config(
                "max_failures must be greater than 0".into(),
            ));
        }

        if config.pool.max_parallel_validations == 0 {
            return Err(common::Error::Config(
                "max_parallel_validations must be greater than 0".into(),
            ));
        }

        if let Ok(raw) = std::env::var("API_KEYS") {
            let keys = split_keys(&raw);
            if !keys.is_empty() {
                config.pool.keys = keys;
            }
        }
        config.pool.keys.retain(|k| !k.trim().is_empty());
        if config.pool.keys.is_empty() {
            return Err(common::Error::Config(
                "no API keys configured: set [pool].keys or API_KEYS".into(),
            ));
        }

        if let Ok(key) = std::env::var("PAID_KEY") {
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.pool.paid_key = Some(Secret::new(key));
            }
        } else if let Some(ref key_file) = config.pool.paid_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read paid_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                config.pool.paid_key = Some(Secret::new(key));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-key-proxy.toml")
    }

    /// Per-probe timeout for key validation.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.validation_timeout_secs)
    }

    /// Pool tunables for `key_pool::initialize`.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_failures: self.pool.max_failures,
            max_parallel_validations: self.pool.max_parallel_validations,
            sequential_threshold: self.pool.sequential_threshold,
            paid_key: self.pool.paid_key.clone(),
        }
    }
}
