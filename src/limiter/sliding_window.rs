//! Sliding window rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::Result;
use crate::limiter::{
    admit_on_store_error, bounded, ceil_seconds, limiter_key, LimiterSettings, LimiterStats,
    RateLimitResult, RateLimiter,
};
use crate::store::{AtomicStore, StoreError};

const KIND: &str = "sliding";

/// Maintains a per-identifier timestamp log to enforce a precise rolling
/// window: no more than `limit` requests in any window of `window_ms`
/// milliseconds, at O(limit) storage per identifier.
///
/// Pruning, counting, and the conditional insert run as one atomic store
/// operation, so concurrent callers across processes cannot overshoot the
/// limit.
pub struct SlidingWindowLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    limit: u64,
    window_ms: u64,
}

impl SlidingWindowLimiter {
    /// Create a sliding window limiter admitting `limit` requests in any
    /// rolling `window_ms` milliseconds.
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

    fn log_key(&self, identifier: &str) -> String {
        limiter_key(&self.settings.key_prefix, KIND, identifier, "log")
    }

    fn result_from(
        &self,
        allowed: bool,
        count_before: u64,
        oldest_ms: Option<u64>,
        now_ms: u64,
    ) -> RateLimitResult {
        let consumed = count_before + u64::from(allowed);
        let reset_at = oldest_ms.map_or(now_ms, |oldest| oldest + self.window_ms);

        RateLimitResult {
            allowed,
            limit: self.limit,
            remaining: self.limit.saturating_sub(consumed),
            reset_at_ms: reset_at,
            retry_after_seconds: (!allowed)
                .then(|| ceil_seconds(reset_at.saturating_sub(now_ms))),
        }
    }

    /// Read-mostly probe: prune aged entries, then read the cardinality and
    /// oldest entry. Not atomic; only `consume` guarantees the bound.
    async fn probe(&self, key: &str) -> std::result::Result<(u64, Option<u64>), StoreError> {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.window_ms);

        bounded(
            self.settings.store_timeout,
            self.store
                .remove_range_by_score(key, 0, cutoff.saturating_sub(1)),
        )
        .await?;
        let count = bounded(self.settings.store_timeout, self.store.cardinality(key)).await?;
        let oldest = bounded(self.settings.store_timeout, self.store.oldest_score(key)).await?;
        Ok((count, oldest))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, identifier: &str) -> RateLimitResult {
        let key = self.log_key(identifier);
        let now = self.clock.now_ms();

        match self.probe(&key).await {
            Ok((count, oldest)) => {
                let allowed = count < self.limit;
                let reset_at = oldest.map_or(now, |o| o + self.window_ms);
                RateLimitResult {
                    allowed,
                    limit: self.limit,
                    remaining: self.limit.saturating_sub(count),
                    reset_at_ms: reset_at,
                    retry_after_seconds: (!allowed)
                        .then(|| ceil_seconds(reset_at.saturating_sub(now))),
                }
            }
            Err(e) => admit_on_store_error(
                self.settings.failure_policy,
                &e,
                self.limit,
                now,
                self.window_ms,
            ),
        }
    }

    async fn consume(&self, identifier: &str) -> RateLimitResult {
        let key = self.log_key(identifier);
        let ttl = ceil_seconds(self.window_ms);
        let nonce: u64 = rand::random();

        trace!(identifier = identifier, "Checking sliding window limit");

        let outcome = match bounded(
            self.settings.store_timeout,
            self.store
                .sliding_window_consume(&key, self.window_ms, self.limit, ttl, nonce),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                return admit_on_store_error(
                    self.settings.failure_policy,
                    &e,
                    self.limit,
                    self.clock.now_ms(),
                    self.window_ms,
                );
            }
        };

        if !outcome.allowed {
            debug!(
                identifier = identifier,
                count = outcome.count_before,
                limit = self.limit,
                "Sliding window limit exceeded"
            );
        }

        self.result_from(
            outcome.allowed,
            outcome.count_before,
            outcome.oldest_ms,
            outcome.now_ms,
        )
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        let key = self.log_key(identifier);
        bounded(self.settings.store_timeout, self.store.delete(&key)).await?;
        Ok(())
    }

    async fn stats(&self, identifier: &str) -> Result<LimiterStats> {
        let key = self.log_key(identifier);
        let (count, oldest) = self.probe(&key).await?;

        Ok(LimiterStats {
            current: count,
            limit: self.limit,
            reset_at_ms: oldest.map_or(self.clock.now_ms(), |o| o + self.window_ms),
        })
    }
}
