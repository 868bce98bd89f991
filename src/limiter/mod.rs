//! Rate limiter trait and shared limiter plumbing.
//!
//! Every limiter is keyed by an opaque caller-supplied identifier (e.g.
//! `"openai:user-42"`), stores its state through [`AtomicStore`], and answers
//! with a [`RateLimitResult`]. Store round-trips are bounded by the configured
//! timeout; a timeout or outage is resolved by the configured
//! [`FailurePolicy`] instead of being surfaced from admission decisions.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::StoreConfig;
use crate::error::{ResilienceError, Result};
use crate::store::{AtomicStore, StoreError};

/// Outcome of a rate limit check or consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// The configured limit
    pub limit: u64,
    /// Requests (or whole tokens) left before the limit is reached
    pub remaining: u64,
    /// When the current window resets or the bucket is full again, epoch ms
    pub reset_at_ms: u64,
    /// Seconds to wait before retrying; only set on rejection
    pub retry_after_seconds: Option<u64>,
}

/// Current usage for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Requests counted (or tokens spent) so far
    pub current: u64,
    /// The configured limit
    pub limit: u64,
    /// When the current window resets or the bucket is full again, epoch ms
    pub reset_at_ms: u64,
}

/// What to do when the store cannot be reached within the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Allow the request; availability of the protected resource outweighs
    /// strict quota enforcement while the coordination store is degraded
    #[default]
    Open,
    /// Deny the request until the store recovers
    Closed,
}

/// Settings shared by every limiter instance.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Prefix applied to every key this limiter writes
    pub key_prefix: String,
    /// Bound on a single store round-trip
    pub store_timeout: Duration,
    /// Behavior when the store is unreachable
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            key_prefix: "palisade".to_string(),
            store_timeout: Duration::from_millis(500),
            failure_policy: FailurePolicy::Open,
        }
    }
}

impl From<&StoreConfig> for LimiterSettings {
    fn from(config: &StoreConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            store_timeout: Duration::from_millis(config.timeout_ms),
            failure_policy: if config.fail_open {
                FailurePolicy::Open
            } else {
                FailurePolicy::Closed
            },
        }
    }
}

/// Trait for rate limiter implementations.
///
/// `check` is a non-consuming probe; `consume` counts the request. Admission
/// decisions never surface store errors (see [`FailurePolicy`]); `reset` and
/// `stats` are administrative operations and do.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Probe whether a request would currently be admitted, without counting it.
    async fn check(&self, identifier: &str) -> RateLimitResult;

    /// Admit and count a request, or reject it with a retry-after hint.
    async fn consume(&self, identifier: &str) -> RateLimitResult;

    /// Like [`consume`](RateLimiter::consume), but with throw-on-exceed
    /// semantics.
    async fn try_consume(&self, identifier: &str) -> Result<RateLimitResult> {
        let result = self.consume(identifier).await;
        if result.allowed {
            Ok(result)
        } else {
            Err(ResilienceError::RateLimitExceeded {
                retry_after_seconds: result.retry_after_seconds.unwrap_or(0),
            })
        }
    }

    /// Forget all state for an identifier.
    async fn reset(&self, identifier: &str) -> Result<()>;

    /// Current usage for an identifier.
    async fn stats(&self, identifier: &str) -> Result<LimiterStats>;
}

/// Build a namespaced store key: `{prefix}:{kind}:{identifier}:{discriminator}`.
pub(crate) fn limiter_key(prefix: &str, kind: &str, identifier: &str, discriminator: &str) -> String {
    format!("{prefix}:{kind}:{identifier}:{discriminator}")
}

/// Round milliseconds up to whole seconds.
pub(crate) fn ceil_seconds(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Bound a store round-trip by `timeout`, mapping elapsed time to
/// [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>> + Send,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout),
    }
}

/// Resolve a store failure according to the limiter's policy.
pub(crate) fn admit_on_store_error(
    policy: FailurePolicy,
    error: &StoreError,
    limit: u64,
    now_ms: u64,
    window_ms: u64,
) -> RateLimitResult {
    match policy {
        FailurePolicy::Open => {
            warn!(error = %error, "Store unreachable, failing open");
            RateLimitResult {
                allowed: true,
                limit,
                remaining: limit,
                reset_at_ms: now_ms + window_ms,
                retry_after_seconds: None,
            }
        }
        FailurePolicy::Closed => {
            warn!(error = %error, "Store unreachable, failing closed");
            RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_at_ms: now_ms + window_ms,
                retry_after_seconds: Some(ceil_seconds(window_ms)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Test doubles shared by the limiter tests.

    use super::*;
    use crate::store::{SlidingWindowOutcome, TokenBucketOutcome};

    /// A store that is permanently unreachable.
    pub(crate) struct FailingStore;

    #[async_trait]
    impl AtomicStore for FailingStore {
        async fn increment_with_expiry(
            &self,
            _key: &str,
            _amount: u64,
            _ttl_seconds: u64,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn sliding_window_consume(
            &self,
            _key: &str,
            _window_ms: u64,
            _limit: u64,
            _ttl_seconds: u64,
            _nonce: u64,
        ) -> std::result::Result<SlidingWindowOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn token_bucket_consume(
            &self,
            _key: &str,
            _requested: f64,
            _bucket_size: f64,
            _refill_per_second: f64,
            _idle_ttl_seconds: u64,
        ) -> std::result::Result<TokenBucketOutcome, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn remove_range_by_score(
            &self,
            _key: &str,
            _min: u64,
            _max: u64,
        ) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn add_to_sorted_set(
            &self,
            _key: &str,
            _score: u64,
            _member: &str,
        ) -> std::result::Result<(), StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn cardinality(&self, _key: &str) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn oldest_score(&self, _key: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn get_counter(&self, _key: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn ttl(&self, _key: &str) -> std::result::Result<Option<u64>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_key_layout() {
        assert_eq!(
            limiter_key("palisade", "fixed", "svc:user-1", "42"),
            "palisade:fixed:svc:user-1:42"
        );
    }

    #[test]
    fn test_ceil_seconds() {
        assert_eq!(ceil_seconds(1000), 1);
        assert_eq!(ceil_seconds(1001), 2);
        assert_eq!(ceil_seconds(999), 1);
        assert_eq!(ceil_seconds(0), 0);
    }

    #[test]
    fn test_settings_from_store_config() {
        let config = StoreConfig {
            url: "redis://localhost".into(),
            key_prefix: "svc".into(),
            timeout_ms: 250,
            fail_open: false,
        };
        let settings = LimiterSettings::from(&config);

        assert_eq!(settings.key_prefix, "svc");
        assert_eq!(settings.store_timeout, Duration::from_millis(250));
        assert_eq!(settings.failure_policy, FailurePolicy::Closed);
    }

    #[test]
    fn test_admit_on_store_error_policies() {
        let err = StoreError::Timeout;

        let open = admit_on_store_error(FailurePolicy::Open, &err, 10, 1_000, 60_000);
        assert!(open.allowed);
        assert_eq!(open.remaining, 10);
        assert_eq!(open.retry_after_seconds, None);

        let closed = admit_on_store_error(FailurePolicy::Closed, &err, 10, 1_000, 60_000);
        assert!(!closed.allowed);
        assert_eq!(closed.remaining, 0);
        assert_eq!(closed.retry_after_seconds, Some(60));
    }
}
