//! Top-level entry point wiring configuration, store, limiters, and breakers.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::error::Result;
use crate::limiter::{
    FixedWindowLimiter, LimiterSettings, SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::resilient::ResilientCall;
use crate::store::{AtomicStore, RedisStore};

/// Owns the shared store connection and hands out limiters, per-dependency
/// breakers, and pre-wired [`ResilientCall`] instances.
///
/// Breakers are created on first use and cached by dependency name, so every
/// caller naming the same dependency shares one state machine. Limiters are
/// cheap stateless handles over the shared store and are built fresh on each
/// call.
pub struct ResilienceLayer {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ResilienceLayer {
    /// Connect to the store named in `config.store.url`.
    pub async fn connect(config: ResilienceConfig) -> Result<Self> {
        let store = RedisStore::connect(&config.store.url).await?;
        info!(url = %config.store.url, "Connected to coordination store");
        Ok(Self::with_store(Arc::new(store), config))
    }

    /// Build a layer over an already-constructed store. Used with
    /// [`MemoryStore`](crate::store::MemoryStore) for tests and
    /// single-process deployments.
    pub fn with_store(store: Arc<dyn AtomicStore>, config: ResilienceConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            config,
            breakers: DashMap::new(),
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn settings(&self) -> LimiterSettings {
        LimiterSettings::from(&self.config.store)
    }

    /// Fixed window limiter using the configured window and request limit.
    pub fn fixed_window(&self) -> Arc<FixedWindowLimiter> {
        Arc::new(FixedWindowLimiter::new(
            self.store.clone(),
            self.clock.clone(),
            self.settings(),
            self.config.limits.max_requests,
            self.config.limits.window_ms,
        ))
    }

    /// Sliding window limiter using the configured window and request limit.
    pub fn sliding_window(&self) -> Arc<SlidingWindowLimiter> {
        Arc::new(SlidingWindowLimiter::new(
            self.store.clone(),
            self.clock.clone(),
            self.settings(),
            self.config.limits.max_requests,
            self.config.limits.window_ms,
        ))
    }

    /// Token bucket limiter using the configured bucket size and refill rate.
    pub fn token_bucket(&self) -> Arc<TokenBucketLimiter> {
        Arc::new(TokenBucketLimiter::new(
            self.store.clone(),
            self.clock.clone(),
            self.settings(),
            self.config.limits.bucket_size,
            self.config.limits.refill_rate_per_second,
        ))
    }

    /// The breaker for `dependency`, created on first use.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::with_config(dependency, self.config.breaker.clone())
                        .with_clock(self.clock.clone()),
                )
            })
            .clone()
    }

    /// A call wrapper with the configured retry policy and no limiter or
    /// breaker attached.
    pub fn call(&self) -> ResilientCall {
        ResilientCall::new(self.config.retry.clone())
    }

    /// A call wrapper guarding `dependency`: sliding window limiter, the
    /// dependency's shared breaker, and the configured retry policy.
    pub fn call_to(&self, dependency: &str) -> ResilientCall {
        ResilientCall::new(self.config.retry.clone())
            .with_limiter(self.sliding_window())
            .with_breaker(self.breaker(dependency))
    }
}
