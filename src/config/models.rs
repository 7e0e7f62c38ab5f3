use crate::retry::RetryPolicy;
use crate::units::ByteSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Transport settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Redirect hops followed before a fetch fails
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Proxy URL applied to every request, e.g. `http://proxy:3128`
    pub proxy: Option<String>,
}

impl HttpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            proxy: None,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    concat!("fetchengine/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_redirects() -> usize {
    10
}

/// Backoff settings applied to every fetcher built by the service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    /// First retry interval; unset means a random value in [1s, 2s)
    pub min_interval_secs: Option<f64>,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: f64,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy {
            enabled: self.enabled,
            ..RetryPolicy::default()
        }
        .with_max_interval(Duration::from_secs_f64(self.max_interval_secs))
        .with_factor(self.factor);
        if let Some(min) = self.min_interval_secs {
            policy = policy.with_min_interval(Duration::from_secs_f64(min));
        }
        policy
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_secs: None,
            max_interval_secs: default_max_interval_secs(),
            factor: default_factor(),
        }
    }
}

fn default_max_interval_secs() -> f64 {
    600.0
}

fn default_factor() -> f64 {
    2.0
}

/// Fetch history defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub cache_dated_data: bool,
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: ByteSize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            cache_dated_data: false,
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_memory_capacity() -> ByteSize {
    crate::history::DEFAULT_MEMORY_CAPACITY
}

/// Chunked upload defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: ByteSize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_chunk_size() -> ByteSize {
    crate::upload::DEFAULT_CHUNK_SIZE
}

/// Logging output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            json_logs: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
