//! Token bucket rate limiter.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::Result;
use crate::limiter::{
    admit_on_store_error, bounded, limiter_key, LimiterSettings, LimiterStats, RateLimitResult,
    RateLimiter,
};
use crate::store::{AtomicStore, TokenBucketOutcome};

const KIND: &str = "bucket";

/// Bucket state is dropped after an hour of inactivity to bound storage;
/// an absent bucket refills from full, so expiry is invisible to callers.
const IDLE_TTL_SECONDS: u64 = 3600;

/// Models a continuously refilling bucket of tokens per identifier: short
/// bursts up to `bucket_size` are admitted while sustained throughput is
/// capped at `refill_rate_per_second`.
///
/// Refill and debit run as one atomic store operation.
pub struct TokenBucketLimiter {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
    settings: LimiterSettings,
    bucket_size: f64,
    refill_rate_per_second: f64,
}

impl TokenBucketLimiter {
    /// Create a token bucket limiter. `refill_rate_per_second` must be
    /// positive.
    pub fn new(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        settings: LimiterSettings,
        bucket_size: f64,
        refill_rate_per_second: f64,
    ) -> Self {
        debug_assert!(refill_rate_per_second > 0.0);
        Self {
            store,
            clock,
            settings,
            bucket_size,
            refill_rate_per_second,
        }
    }

    fn bucket_key(&self, identifier: &str) -> String {
        limiter_key(&self.settings.key_prefix, KIND, identifier, "state")
    }

    /// Milliseconds until the bucket refills back to capacity.
    fn ms_until_full(&self, tokens: f64) -> u64 {
        let deficit = (self.bucket_size - tokens).max(0.0);
        (deficit / self.refill_rate_per_second * 1000.0).ceil() as u64
    }

    fn result_from(&self, requested: f64, outcome: TokenBucketOutcome) -> RateLimitResult {
        let retry_after_seconds = if outcome.allowed {
            None
        } else {
            let deficit = requested - outcome.tokens_remaining;
            Some((deficit / self.refill_rate_per_second).ceil() as u64)
        };

        RateLimitResult {
            allowed: outcome.allowed,
            limit: self.bucket_size as u64,
            remaining: outcome.tokens_remaining.floor() as u64,
            reset_at_ms: outcome.now_ms + self.ms_until_full(outcome.tokens_remaining),
            retry_after_seconds,
        }
    }

    /// Admit and debit `tokens` tokens, or reject with a retry-after hint.
    ///
    /// The trait-level [`consume`](RateLimiter::consume) debits one token.
    pub async fn consume_tokens(&self, identifier: &str, tokens: f64) -> RateLimitResult {
        let key = self.bucket_key(identifier);

        trace!(
            identifier = identifier,
            tokens = tokens,
            "Checking token bucket"
        );

        let outcome = match bounded(
            self.settings.store_timeout,
            self.store.token_bucket_consume(
                &key,
                tokens,
                self.bucket_size,
                self.refill_rate_per_second,
                IDLE_TTL_SECONDS,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let now = self.clock.now_ms();
                return admit_on_store_error(
                    self.settings.failure_policy,
                    &e,
                    self.bucket_size as u64,
                    now,
                    self.ms_until_full(0.0),
                );
            }
        };

        if !outcome.allowed {
            debug!(
                identifier = identifier,
                requested = tokens,
                available = outcome.tokens_remaining,
                "Token bucket exhausted"
            );
        }

        self.result_from(tokens, outcome)
    }

    /// Refill without debiting, returning the current bucket level.
    async fn peek(&self, identifier: &str) -> std::result::Result<TokenBucketOutcome, crate::store::StoreError> {
        let key = self.bucket_key(identifier);
        bounded(
            self.settings.store_timeout,
            self.store.token_bucket_consume(
                &key,
                0.0,
                self.bucket_size,
                self.refill_rate_per_second,
                IDLE_TTL_SECONDS,
            ),
        )
        .await
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(&self, identifier: &str) -> RateLimitResult {
        match self.peek(identifier).await {
            Ok(outcome) => {
                let allowed = outcome.tokens_remaining >= 1.0;
                let retry_after_seconds = (!allowed).then(|| {
                    ((1.0 - outcome.tokens_remaining) / self.refill_rate_per_second).ceil() as u64
                });
                RateLimitResult {
                    allowed,
                    limit: self.bucket_size as u64,
                    remaining: outcome.tokens_remaining.floor() as u64,
                    reset_at_ms: outcome.now_ms + self.ms_until_full(outcome.tokens_remaining),
                    retry_after_seconds,
                }
            }
            Err(e) => admit_on_store_error(
                self.settings.failure_policy,
                &e,
                self.bucket_size as u64,
                self.clock.now_ms(),
                self.ms_until_full(0.0),
            ),
        }
    }

    async fn consume(&self, identifier: &str) -> RateLimitResult {
        self.consume_tokens(identifier, 1.0).await
    }

    async fn reset(&self, identifier: &str) -> Result<()> {
        let key = self.bucket_key(identifier);
        bounded(self.settings.store_timeout, self.store.delete(&key)).await?;
        Ok(())
    }

    async fn stats(&self, identifier: &str) -> Result<LimiterStats> {
        let outcome = self.peek(identifier).await?;
        let spent = (self.bucket_size - outcome.tokens_remaining).ceil() as u64;

        Ok(LimiterStats {
            current: spent,
            limit: self.bucket_size as u64,
            reset_at_ms: outcome.now_ms + self.ms_until_full(outcome.tokens_remaining),
        })
    }
}
