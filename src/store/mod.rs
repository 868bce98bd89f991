//! Shared atomic counter store.
//!
//! All limiter state lives behind the [`AtomicStore`] trait. Every operation
//! is atomic with respect to concurrent callers across processes: backends
//! must use their native atomic primitives (server-side scripts, single
//! commands, or a process-wide lock), never read-then-write from the client.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by an [`AtomicStore`] backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the configured timeout
    #[error("store timed out")]
    Timeout,

    /// The store answered with something the client could not interpret
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_timeout() {
            StoreError::Timeout
        } else if e.is_connection_refusal() || e.is_io_error() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Protocol(e.to_string())
        }
    }
}

/// Outcome of an atomic sliding-window consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindowOutcome {
    /// Whether an entry was inserted (the request was admitted)
    pub allowed: bool,
    /// Log cardinality before the conditional insert
    pub count_before: u64,
    /// Timestamp of the oldest surviving entry, if any
    pub oldest_ms: Option<u64>,
    /// The store-side time the decision was made at
    pub now_ms: u64,
}

/// Outcome of an atomic token-bucket consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketOutcome {
    /// Whether the requested tokens were debited
    pub allowed: bool,
    /// Tokens left in the bucket after refill (and debit, if allowed)
    pub tokens_remaining: f64,
    /// The store-side time the decision was made at
    pub now_ms: u64,
}

/// A shared, network-accessible key/value store with atomic counters,
/// multi-step atomic read-modify-write operations, and sorted sets.
///
/// The multi-step operations ([`sliding_window_consume`] and
/// [`token_bucket_consume`]) are named compositions of what the backend
/// executes as a single indivisible script or critical section.
///
/// [`sliding_window_consume`]: AtomicStore::sliding_window_consume
/// [`token_bucket_consume`]: AtomicStore::token_bucket_consume
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Atomically increment `key` by `amount`, setting `ttl_seconds` only if
    /// the key was just created. Returns the post-increment value.
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: u64,
    ) -> Result<u64, StoreError>;

    /// Atomically prune entries older than the window, read the cardinality,
    /// and insert an entry at the current time iff the count is below `limit`.
    async fn sliding_window_consume(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        ttl_seconds: u64,
        nonce: u64,
    ) -> Result<SlidingWindowOutcome, StoreError>;

    /// Atomically refill the bucket proportionally to elapsed time, then debit
    /// `requested` tokens iff enough are available. A `requested` of zero
    /// peeks at the refilled level without debiting.
    async fn token_bucket_consume(
        &self,
        key: &str,
        requested: f64,
        bucket_size: f64,
        refill_per_second: f64,
        idle_ttl_seconds: u64,
    ) -> Result<TokenBucketOutcome, StoreError>;

    /// Remove sorted-set members with scores in `[min, max]`. Returns the
    /// number of members removed.
    async fn remove_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<u64, StoreError>;

    /// Add a member to a sorted set with the given score.
    async fn add_to_sorted_set(
        &self,
        key: &str,
        score: u64,
        member: &str,
    ) -> Result<(), StoreError>;

    /// Number of members in a sorted set.
    async fn cardinality(&self, key: &str) -> Result<u64, StoreError>;

    /// Score of the oldest member of a sorted set, if any.
    async fn oldest_score(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Read a plain counter value, `None` if the key is absent or expired.
    async fn get_counter(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Remaining TTL of a key in seconds, `None` if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Delete a key. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
