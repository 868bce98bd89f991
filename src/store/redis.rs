//! Redis-backed store implementation.
//!
//! Multi-step read-modify-write operations run as server-side Lua scripts so
//! they are indivisible with respect to every other client of the store. The
//! scripts read the server's own `TIME`, which keeps window and refill
//! decisions on a single authoritative clock regardless of skew between the
//! issuing processes.

use redis::aio::ConnectionManager;

use super::{AtomicStore, SlidingWindowOutcome, StoreError, TokenBucketOutcome};
use async_trait::async_trait;

/// Increment, setting the TTL only when the key was just created.
const INCREMENT_WITH_EXPIRY: &str = r#"
local value = redis.call("INCRBY", KEYS[1], ARGV[1])
if value == tonumber(ARGV[1]) then
    redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return value
"#;

/// Prune the log, count it, and insert the current time iff below the limit.
const SLIDING_WINDOW_CONSUME: &str = r#"
local time = redis.call("TIME")
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local window_ms = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local nonce = ARGV[4]

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. (now - window_ms))

local count = redis.call("ZCARD", KEYS[1])
local allowed = 0
if count < limit then
    redis.call("ZADD", KEYS[1], now, now .. "-" .. nonce)
    redis.call("EXPIRE", KEYS[1], ttl)
    allowed = 1
end

local oldest = -1
local head = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
if #head > 0 then
    oldest = tonumber(head[2])
end

return {allowed, count, oldest, now}
"#;

/// Refill proportionally to elapsed time, then debit iff enough tokens remain.
/// Tokens are returned as a string: Lua-to-Redis number conversion truncates
/// fractional values.
const TOKEN_BUCKET_CONSUME: &str = r#"
local time = redis.call("TIME")
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

local bucket_size = tonumber(ARGV[1])
local refill_per_second = tonumber(ARGV[2])
local requested = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call("HMGET", KEYS[1], "tokens", "last_refill_ms")
local tokens = tonumber(state[1])
local last_refill_ms = tonumber(state[2])
if tokens == nil then
    tokens = bucket_size
    last_refill_ms = now
end

local elapsed_ms = math.max(0, now - last_refill_ms)
tokens = math.min(bucket_size, tokens + elapsed_ms * refill_per_second / 1000)

local allowed = 0
if tokens >= requested then
    tokens = tokens - requested
    allowed = 1
end

redis.call("HSET", KEYS[1], "tokens", tokens, "last_refill_ms", now)
redis.call("EXPIRE", KEYS[1], ttl)

return {allowed, tostring(tokens), now}
"#;

/// An [`AtomicStore`] backed by a shared Redis instance.
///
/// Cloning is cheap: the underlying [`ConnectionManager`] multiplexes one
/// connection that transparently reconnects, and is shared by all limiter
/// instances in the process.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    /// Build a store around an existing connection manager.
    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: u64,
    ) -> Result<u64, StoreError> {
        let script = redis::Script::new(INCREMENT_WITH_EXPIRY);
        let value: u64 = script
            .key(key)
            .arg(amount)
            .arg(ttl_seconds)
            .invoke_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn sliding_window_consume(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        ttl_seconds: u64,
        nonce: u64,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        let script = redis::Script::new(SLIDING_WINDOW_CONSUME);
        let (allowed, count_before, oldest, now_ms): (i64, u64, i64, u64) = script
            .key(key)
            .arg(window_ms)
            .arg(limit)
            .arg(ttl_seconds)
            .arg(nonce)
            .invoke_async(&mut self.conn())
            .await?;

        Ok(SlidingWindowOutcome {
            allowed: allowed == 1,
            count_before,
            oldest_ms: (oldest >= 0).then_some(oldest as u64),
            now_ms,
        })
    }

    async fn token_bucket_consume(
        &self,
        key: &str,
        requested: f64,
        bucket_size: f64,
        refill_per_second: f64,
        idle_ttl_seconds: u64,
    ) -> Result<TokenBucketOutcome, StoreError> {
        let script = redis::Script::new(TOKEN_BUCKET_CONSUME);
        let (allowed, tokens, now_ms): (i64, String, u64) = script
            .key(key)
            .arg(bucket_size)
            .arg(refill_per_second)
            .arg(requested)
            .arg(idle_ttl_seconds)
            .invoke_async(&mut self.conn())
            .await?;

        let tokens_remaining: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Protocol(format!("unparseable token count `{tokens}`")))?;

        Ok(TokenBucketOutcome {
            allowed: allowed == 1,
            tokens_remaining,
            now_ms,
        })
    }

    async fn remove_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<u64, StoreError> {
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed)
    }

    async fn add_to_sorted_set(
        &self,
        key: &str,
        score: u64,
        member: &str,
    ) -> Result<(), StoreError> {
        redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(count)
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let head: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut self.conn())
            .await?;
        Ok(head.first().map(|(_, score)| *score as u64))
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        // -2 means the key is absent, -1 means no expiry is set
        Ok((ttl >= 0).then_some(ttl as u64))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: u64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(removed > 0)
    }
}
