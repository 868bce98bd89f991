//! Fixed window rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::Result;
use crate::limiter::{
    admit_on_store_error, bounded, ceil_seconds, limiter_key, LimiterSettings, LimiterStats,
    RateLimitResult, RateLimiter,
};
use crate::store::AtomicStore;

const KIND: &str = "fixed";

/// Buckets time into fixed windows and counts requests per identifier per
/// window with a single atomic increment.
///
/// Bursts straddling a window boundary can momentarily admit up to twice the
/// limit across the boundary; callers needing a precise rolling bound should
/// use [`SlidingWindowLimiter`](crate::limiter::SlidingWindowLimiter).
pub struct FixedWindowLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    limit: u64,
    window_ms: u64,
}

impl FixedWindowLimiter {
    /// Create a fixed window limiter admitting `limit` requests per
    /// `window_ms` milliseconds.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        settings: LimiterSettings,
        limit: u64,
        window_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            limit,
            window_ms,
        }
    }

    fn window_key(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms
    }

    fn counter_key(&self, identifier: &str, window_key: u64) -> String {
        limiter_key(
            &self.settings.key_prefix,
            KIND,
            identifier,
            &window_key.to_string(),
        )
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, identifier: &str) -> RateLimitResult {
        let now = self.clock.now_ms();
        let window_key = self.window_key(now);
        let key = self.counter_key(identifier, window_key);
        let reset_at = (window_key + 1) * self.window_ms;

        let count = match bounded(self.settings.store_timeout, self.store.get_counter(&key)).await
        {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                return admit_on_store_error(
                    self.settings.failure_policy,
                    &e,
                    self.limit,
                    now,
                    self.window_ms,
                );
            }
        };

        let allowed = count < self.limit;
        RateLimitResult {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_at_ms: reset_at,
            retry_after_seconds: (!allowed).then(|| ceil_seconds(reset_at.saturating_sub(now))),
        }
    }

    async fn consume(&self, identifier: &str) -> RateLimitResult {
        let now = self.clock.now_ms();
        let window_key = self.window_key(now);
        let key = self.counter_key(identifier, window_key);
        let reset_at = (window_key + 1) * self.window_ms;
        let ttl = ceil_seconds(self.window_ms);

        trace!(
            identifier = identifier,
            window = window_key,
            "Checking fixed window limit"
        );

        let count = match bounded(
            self.settings.store_timeout,
            self.store.increment_with_expiry(&key, 1, ttl),
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                return admit_on_store_error(
                    self.settings.failure_policy,
                    &e,
                    self.limit,
                    now,
                    self.window_ms,
                );
            }
        };

        let allowed = count <= self.limit;
        if !allowed {
            debug!(
                identifier = identifier,
                count = count,
                limit = self.limit,
                "Fixed window limit exceeded"
            );
        }

        RateLimitResult {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(count),
            reset_at_ms: reset_at,
            retry_after_seconds: (!allowed).then(|| ceil_seconds(reset_at.saturating_sub(now))),
        }
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        let window_key = self.window_key(self.clock.now_ms());
        let key = self.counter_key(identifier, window_key);
        bounded(self.settings.store_timeout, self.store.delete(&key)).await?;
        Ok(())
    }

    async fn stats(&self, identifier: &str) -> Result<LimiterStats> {
        let now = self.clock.now_ms();
        let window_key = self.window_key(now);
        let key = self.counter_key(identifier, window_key);

        let current = bounded(self.settings.store_timeout, self.store.get_counter(&key))
            .await?
            .unwrap_or(0);

        Ok(LimiterStats {
            current,
            limit: self.limit,
            reset_at_ms: (window_key + 1) * self.window_ms,
        })
    }
}
