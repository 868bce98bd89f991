//! Configuration management for Palisade.

use serde::{Deserialize, Serialize};

/// Main configuration for the resilience layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Atomic store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit configuration
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Atomic store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Prefix applied to every key written by this layer
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for a single store round-trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,

    /// Allow requests when the store is unreachable (fail-open)
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
            fail_open: default_fail_open(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "palisade".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_fail_open() -> bool {
    true
}

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Window length for window-based limiters in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Maximum requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Token bucket capacity
    #[serde(default = "default_bucket_size")]
    pub bucket_size: f64,

    /// Token bucket refill rate in tokens per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            bucket_size: default_bucket_size(),
            refill_rate_per_second: default_refill_rate(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u64 {
    1000
}

fn default_bucket_size() -> f64 {
    100.0
}

fn default_refill_rate() -> f64 {
    10.0
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before admitting probes, in milliseconds
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Maximum concurrent probes while half-open
    #[serde(default = "default_max_half_open_probes")]
    pub max_half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            max_half_open_probes: default_max_half_open_probes(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_max_half_open_probes() -> u32 {
    1
}

/// Retry configuration for resilient calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl ResilienceConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ResilienceConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::ResilienceError::Config(e.to_string()))?;
        Ok(config)
    }
}
