//! Palisade - Resilience Layer for Shared Downstream Resources
//!
//! This crate protects shared external resources (third-party APIs, model
//! endpoints, downstream services) from overload and cascading failure when
//! they are accessed concurrently by many stateless service instances. It
//! provides three interchangeable rate-limiting algorithms over a shared
//! atomic counter store, a per-dependency circuit breaker, and a resilient
//! call wrapper composing retry-with-backoff around both.

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod layer;
pub mod limiter;
pub mod resilient;
pub mod store;
