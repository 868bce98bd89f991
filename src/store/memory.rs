//! In-process store implementation.
//!
//! Backs the limiters with a single process-wide mutex instead of a shared
//! network store. Suitable for tests and single-instance deployments; the
//! whole-map lock is the atomicity guarantee here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};

use super::{AtomicStore, SlidingWindowOutcome, StoreError, TokenBucketOutcome};

const NO_EXPIRY: u64 = u64::MAX;

#[derive(Debug)]
enum Entry {
    Counter { value: u64, expires_at_ms: u64 },
    SortedSet { members: Vec<(u64, String)>, expires_at_ms: u64 },
    Bucket { tokens: f64, last_refill_ms: u64, expires_at_ms: u64 },
}

impl Entry {
    fn expires_at_ms(&self) -> u64 {
        match self {
            Entry::Counter { expires_at_ms, .. }
            | Entry::SortedSet { expires_at_ms, .. }
            | Entry::Bucket { expires_at_ms, .. } => *expires_at_ms,
        }
    }
}

/// An [`AtomicStore`] held entirely in process memory.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a memory store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a memory store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of live keys, expiring stale ones first.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.expires_at_ms() > now);
        entries.len()
    }

    fn expire(entries: &mut HashMap<String, Entry>, key: &str, now_ms: u64) {
        if let Some(entry) = entries.get(key) {
            if entry.expires_at_ms() <= now_ms {
                entries.remove(key);
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_kind(key: &str) -> StoreError {
    StoreError::Protocol(format!("key `{key}` holds a different value kind"))
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        amount: u64,
        ttl_seconds: u64,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.to_string(),
                    Entry::Counter {
                        value: amount,
                        expires_at_ms: now + ttl_seconds * 1000,
                    },
                );
                Ok(amount)
            }
            Some(Entry::Counter { value, .. }) => {
                *value += amount;
                Ok(*value)
            }
            Some(_) => Err(wrong_kind(key)),
        }
    }

    async fn sliding_window_consume(
        &self,
        key: &str,
        window_ms: u64,
        limit: u64,
        ttl_seconds: u64,
        nonce: u64,
    ) -> Result<SlidingWindowOutcome, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert(Entry::SortedSet {
            members: Vec::new(),
            expires_at_ms: now + ttl_seconds * 1000,
        });
        let Entry::SortedSet {
            members,
            expires_at_ms,
        } = entry
        else {
            return Err(wrong_kind(key));
        };

        let cutoff = now.saturating_sub(window_ms);
        members.retain(|(score, _)| *score >= cutoff);

        let count_before = members.len() as u64;
        let allowed = count_before < limit;
        if allowed {
            members.push((now, format!("{now}-{nonce}")));
            members.sort_by_key(|(score, _)| *score);
            *expires_at_ms = now + ttl_seconds * 1000;
        }

        let oldest_ms = members.first().map(|(score, _)| *score);
        if members.is_empty() {
            entries.remove(key);
        }

        Ok(SlidingWindowOutcome {
            allowed,
            count_before,
            oldest_ms,
            now_ms: now,
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
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        let (mut tokens, last_refill_ms) = match entries.get(key) {
            None => (bucket_size, now),
            Some(Entry::Bucket {
                tokens,
                last_refill_ms,
                ..
            }) => (*tokens, *last_refill_ms),
            Some(_) => return Err(wrong_kind(key)),
        };

        let elapsed_ms = now.saturating_sub(last_refill_ms);
        tokens = (tokens + elapsed_ms as f64 * refill_per_second / 1000.0).min(bucket_size);

        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }

        entries.insert(
            key.to_string(),
            Entry::Bucket {
                tokens,
                last_refill_ms: now,
                expires_at_ms: now + idle_ttl_seconds * 1000,
            },
        );

        Ok(TokenBucketOutcome {
            allowed,
            tokens_remaining: tokens,
            now_ms: now,
        })
    }

    async fn remove_range_by_score(
        &self,
        key: &str,
        min: u64,
        max: u64,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get_mut(key) {
            None => Ok(0),
            Some(Entry::SortedSet { members, .. }) => {
                let before = members.len();
                members.retain(|(score, _)| *score < min || *score > max);
                let removed = (before - members.len()) as u64;
                if members.is_empty() {
                    entries.remove(key);
                }
                Ok(removed)
            }
            Some(_) => Err(wrong_kind(key)),
        }
    }

    async fn add_to_sorted_set(
        &self,
        key: &str,
        score: u64,
        member: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        let entry = entries.entry(key.to_string()).or_insert(Entry::SortedSet {
            members: Vec::new(),
            expires_at_ms: NO_EXPIRY,
        });
        let Entry::SortedSet { members, .. } = entry else {
            return Err(wrong_kind(key));
        };

        members.retain(|(_, m)| m != member);
        members.push((score, member.to_string()));
        members.sort_by_key(|(score, _)| *score);
        Ok(())
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get(key) {
            None => Ok(0),
            Some(Entry::SortedSet { members, .. }) => Ok(members.len() as u64),
            Some(_) => Err(wrong_kind(key)),
        }
    }

    async fn oldest_score(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get(key) {
            None => Ok(None),
            Some(Entry::SortedSet { members, .. }) => {
                Ok(members.first().map(|(score, _)| *score))
            }
            Some(_) => Err(wrong_kind(key)),
        }
    }

    async fn get_counter(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Counter { value, .. }) => Ok(Some(*value)),
            Some(_) => Err(wrong_kind(key)),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);

        match entries.get(key) {
            None => Ok(None),
            Some(entry) => {
                let expires = entry.expires_at_ms();
                if expires == NO_EXPIRY {
                    Ok(None)
                } else {
                    Ok(Some((expires - now).div_ceil(1000)))
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        Self::expire(&mut entries, key, now);
        Ok(entries.remove(key).is_some())
    }
}
