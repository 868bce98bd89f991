//! Resilient call wrapper.
//!
//! Composes an optional rate limiter, an optional circuit breaker, and
//! retry-with-backoff around a caller-supplied async operation. Rate-limit
//! and circuit-open rejections are surfaced immediately and never retried
//! here; retrying them would amplify load on an already-stressed system.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::limiter::RateLimiter;

/// Error returned from [`ResilientCall::execute`].
#[derive(Error, Debug)]
pub enum CallError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The configured limiter rejected the call before any attempt was made
    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the quota admits another request
        retry_after_seconds: u64,
    },

    /// The configured breaker is open; the call was not attempted
    #[error("circuit open for dependency `{dependency}`, retry in {retry_in_ms}ms")]
    CircuitOpen {
        /// Name of the guarded dependency
        dependency: String,
        /// Milliseconds until the breaker will admit a probe
        retry_in_ms: u64,
    },

    /// The operation failed on every attempt
    #[error("call failed after {attempts} attempt(s)")]
    Exhausted {
        /// Attempts made, including the initial call
        attempts: u32,
        /// The last underlying error
        #[source]
        source: E,
    },
}

/// Wraps an async operation with rate limiting, circuit breaking, and
/// jittered exponential backoff.
///
/// Per invocation: the limiter is consulted first (a rejection is final),
/// then the breaker admits the call or fails fast, then the operation is
/// attempted with up to `max_retries` retries for errors the retry predicate
/// accepts. The final outcome, success or exhaustion, is reported to the
/// breaker.
///
/// Dropping the returned future between attempts cancels the next scheduled
/// retry; counters already committed to the store stay committed.
#[derive(Clone)]
pub struct ResilientCall {
    retry: RetryConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl ResilientCall {
    /// Create a wrapper with the given retry policy and no limiter or breaker.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            limiter: None,
            breaker: None,
        }
    }

    /// Consume from `limiter` before every invocation.
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Guard every invocation with `breaker`.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Execute `operation`, retrying every error up to the retry budget.
    pub async fn execute<T, E, F, Fut>(
        &self,
        identifier: &str,
        operation: F,
    ) -> Result<T, CallError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(identifier, operation, |_| true).await
    }

    /// Execute `operation`, retrying only errors `retryable` accepts.
    ///
    /// Errors rejected by the predicate are terminal: they propagate on the
    /// first occurrence and still count toward breaker failure tracking.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        identifier: &str,
        operation: F,
        retryable: P,
    ) -> Result<T, CallError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        if let Some(limiter) = &self.limiter {
            let decision = limiter.consume(identifier).await;
            if !decision.allowed {
                let retry_after_seconds = decision.retry_after_seconds.unwrap_or(0);
                debug!(
                    identifier = identifier,
                    retry_after_seconds = retry_after_seconds,
                    "Call rejected by rate limiter"
                );
                return Err(CallError::RateLimited {
                    retry_after_seconds,
                });
            }
        }

        let mut permit = match &self.breaker {
            Some(breaker) => Some(breaker.try_acquire().map_err(|open| {
                debug!(
                    dependency = breaker.name(),
                    retry_in_ms = open.retry_in_ms,
                    "Call rejected by open circuit"
                );
                CallError::CircuitOpen {
                    dependency: breaker.name().to_string(),
                    retry_in_ms: open.retry_in_ms,
                }
            })?),
            None => None,
        };

        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if let Some(permit) = permit.take() {
                        permit.success();
                    }
                    if attempt > 0 {
                        debug!(
                            identifier = identifier,
                            attempts = attempt + 1,
                            "Call succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let attempts = attempt + 1;
                    if attempt >= self.retry.max_retries || !retryable(&e) {
                        if let Some(permit) = permit.take() {
                            permit.failure();
                        }
                        warn!(
                            identifier = identifier,
                            attempts = attempts,
                            error = %e,
                            "Call failed"
                        );
                        return Err(CallError::Exhausted {
                            attempts,
                            source: e,
                        });
                    }

                    let delay = self.backoff_delay(attempt);
                    debug!(
                        identifier = identifier,
                        attempt = attempts,
                        max = self.retry.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `min(max_delay, base × 2^attempt × jitter)` with jitter drawn
    /// uniformly from `[0.5, 1.5)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let delay_ms = self.retry.base_delay_ms as f64 * 2f64.powi(attempt as i32) * jitter;
        Duration::from_millis(delay_ms.min(self.retry.max_delay_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use crate::clock::{Clock, ManualClock};
    use crate::config::BreakerConfig;
    use crate::limiter::{FixedWindowLimiter, LimiterSettings};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("transient glitch")]
    struct Glitch;

    fn retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
    }

    fn flaky_op(
        failures_before_success: u32,
    ) -> (Arc<AtomicU32>, impl Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, Glitch>> + Send>>)
    {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < failures_before_success {
                    Err(Glitch)
                } else {
                    Ok(n + 1)
                }
            }) as std::pin::Pin<Box<dyn Future<Output = Result<u32, Glitch>> + Send>>
        };
        (calls, op)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let call = ResilientCall::new(retry_config(3));
        let (calls, op) = flaky_op(2);

        let result = call.execute("u1", op).await.unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_attempt_count_and_last_error() {
        let call = ResilientCall::new(retry_config(2));
        let (calls, op) = flaky_op(u32::MAX);

        let err = call.execute("u1", op).await.unwrap_err();
        match err {
            CallError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_errors_propagate_on_first_attempt() {
        let call = ResilientCall::new(retry_config(5));
        let (calls, op) = flaky_op(u32::MAX);

        let err = call.execute_with("u1", op, |_| false).await.unwrap_err();
        match err {
            CallError::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_call_is_never_attempted() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = Arc::new(FixedWindowLimiter::new(
            store,
            clock,
            LimiterSettings::default(),
            1,
            60_000,
        ));

        let call = ResilientCall::new(retry_config(3)).with_limiter(limiter);
        let (calls, op) = flaky_op(0);

        assert!(call.execute("u1", &op).await.is_ok());

        let err = call.execute("u1", &op).await.unwrap_err();
        match err {
            CallError::RateLimited {
                retry_after_seconds,
            } => assert!(retry_after_seconds > 0),
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_without_attempts() {
        let clock = ManualClock::new(0);
        let breaker = Arc::new(
            crate::breaker::CircuitBreaker::with_config(
                "upstream",
                BreakerConfig {
                    failure_threshold: 1,
                    reset_timeout_ms: 5_000,
                    max_half_open_probes: 1,
                },
            )
            .with_clock(Arc::new(clock.clone())),
        );

        let call = ResilientCall::new(retry_config(0)).with_breaker(breaker.clone());
        let (calls, op) = flaky_op(u32::MAX);

        // First call fails and opens the circuit
        assert!(call.execute("u1", &op).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Second call fails fast without touching the operation
        let err = call.execute("u1", &op).await.unwrap_err();
        assert!(matches!(err, CallError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_outcome_is_reported_to_the_breaker() {
        let breaker = Arc::new(crate::breaker::CircuitBreaker::with_config(
            "upstream",
            BreakerConfig {
                failure_threshold: 10,
                reset_timeout_ms: 5_000,
                max_half_open_probes: 1,
            },
        ));

        let call = ResilientCall::new(retry_config(2)).with_breaker(breaker.clone());
        let (_, op) = flaky_op(u32::MAX);

        // Three attempts inside one invocation count as one breaker failure
        assert!(call.execute("u1", &op).await.is_err());
        assert_eq!(breaker.snapshot().consecutive_failures, 1);

        let (_, op) = flaky_op(0);
        assert!(call.execute("u1", &op).await.is_ok());
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_backoff_delay_is_jittered_and_capped() {
        let call = ResilientCall::new(RetryConfig {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        });

        for attempt in 0..10 {
            let delay = call.backoff_delay(attempt).as_millis() as u64;
            let unjittered = 100u64.saturating_mul(1 << attempt.min(20));
            assert!(delay <= 1_000);
            assert!(delay >= (unjittered / 2).min(1_000) - 1);
        }
    }
}
