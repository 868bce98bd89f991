//! Circuit breaker guarding calls to a named downstream dependency.
//!
//! One breaker instance per dependency, state owned by the process. Instances
//! in a fleet degrade independently; sharing breaker state across instances
//! was deliberately not done, the per-process machine is simpler and each
//! instance converges on the same verdict within one failure threshold.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted
    Closed,
    /// Calls fail fast until the reset timeout elapses
    Open,
    /// A limited number of probe calls test whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Error returned from [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum BreakerError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit is open; the operation was not attempted
    #[error("circuit open for dependency `{dependency}`, retry in {retry_in_ms}ms")]
    Open {
        /// Name of the guarded dependency
        dependency: String,
        /// Milliseconds until the breaker will admit a probe
        retry_in_ms: u64,
    },

    /// The operation itself failed
    #[error(transparent)]
    Inner(E),
}

/// Returned by [`CircuitBreaker::try_acquire`] when the circuit is open.
#[derive(Debug, Clone, Copy)]
pub struct OpenCircuit {
    /// Milliseconds until the breaker will admit a probe; zero while probe
    /// slots are occupied in half-open
    pub retry_in_ms: u64,
}

/// Observable breaker state, exposed for logging and dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state (open-to-half-open transitions happen on the next call)
    pub state: CircuitState,
    /// Consecutive counted failures
    pub consecutive_failures: u32,
    /// When the circuit last opened, epoch ms
    pub opened_at_ms: Option<u64>,
}

type TransitionCallback = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
    probes_in_flight: u32,
}

/// A three-state circuit breaker for one named dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    on_transition: Option<Arc<TransitionCallback>>,
}

impl CircuitBreaker {
    /// Create a breaker for `name` with default configuration.
    pub fn new(name: &str) -> Self {
        Self::with_config(name, BreakerConfig::default())
    }

    /// Create a breaker for `name` with the given configuration.
    pub fn with_config(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            clock: Arc::new(SystemClock::new()),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at_ms: None,
                probes_in_flight: 0,
            }),
            on_transition: None,
        }
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Observe state transitions as `(dependency, from, to)`.
    pub fn on_transition<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(callback));
        self
    }

    /// Name of the guarded dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current observable state.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at_ms: inner.opened_at_ms,
        }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force the breaker back to closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.opened_at_ms = None;
            inner.probes_in_flight = 0;
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        self.notify(transition);
    }

    /// Ask the breaker to admit a call.
    ///
    /// On success the returned [`CallPermit`] must be settled with
    /// [`success`](CallPermit::success) or [`failure`](CallPermit::failure);
    /// an abandoned permit releases its half-open probe slot without
    /// recording an outcome.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, OpenCircuit> {
        let now = self.clock.now_ms();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let opened_at = inner.opened_at_ms.unwrap_or(now);
                    let elapsed = now.saturating_sub(opened_at);
                    if elapsed >= self.config.reset_timeout_ms {
                        inner.state = CircuitState::HalfOpen;
                        inner.probes_in_flight = 1;
                        (
                            Ok(true),
                            Some((CircuitState::Open, CircuitState::HalfOpen)),
                        )
                    } else {
                        (
                            Err(OpenCircuit {
                                retry_in_ms: self.config.reset_timeout_ms - elapsed,
                            }),
                            None,
                        )
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probes_in_flight < self.config.max_half_open_probes {
                        inner.probes_in_flight += 1;
                        (Ok(true), None)
                    } else {
                        (Err(OpenCircuit { retry_in_ms: 0 }), None)
                    }
                }
            }
        };
        self.notify(transition);

        result.map(|probe| CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Run `operation` under the breaker; every error counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(operation, |_| true).await
    }

    /// Run `operation` under the breaker with a failure classifier.
    ///
    /// Errors for which `is_failure` returns `false` are benign (a 4xx from a
    /// healthy dependency, say): they propagate to the caller but count as a
    /// successful contact for state tracking.
    pub async fn execute_with<T, E, F, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let permit = self.try_acquire().map_err(|open| BreakerError::Open {
            dependency: self.name.clone(),
            retry_in_ms: open.retry_in_ms,
        })?;

        match operation().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    permit.failure();
                } else {
                    permit.success();
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn record(&self, success: bool, probe: bool) {
        let now = self.clock.now_ms();
        let transition = {
            let mut inner = self.inner.lock();
            if probe {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }

            if success {
                inner.consecutive_failures = 0;
                if inner.state == CircuitState::HalfOpen {
                    inner.state = CircuitState::Closed;
                    inner.opened_at_ms = None;
                    inner.probes_in_flight = 0;
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            } else {
                inner.consecutive_failures += 1;
                match inner.state {
                    CircuitState::HalfOpen => {
                        inner.state = CircuitState::Open;
                        inner.opened_at_ms = Some(now);
                        inner.probes_in_flight = 0;
                        Some((CircuitState::HalfOpen, CircuitState::Open))
                    }
                    CircuitState::Closed
                        if inner.consecutive_failures >= self.config.failure_threshold =>
                    {
                        inner.state = CircuitState::Open;
                        inner.opened_at_ms = Some(now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    }
                    _ => None,
                }
            }
        };
        self.notify(transition);
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
    }

    /// Invoked after the state lock is released; callbacks may call back into
    /// the breaker.
    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        match to {
            CircuitState::Open => warn!(
                dependency = %self.name,
                from = %from,
                "Circuit opened"
            ),
            CircuitState::HalfOpen => debug!(
                dependency = %self.name,
                "Circuit half-open, probing dependency"
            ),
            CircuitState::Closed => info!(
                dependency = %self.name,
                "Circuit closed"
            ),
        }

        if let Some(callback) = &self.on_transition {
            callback(&self.name, from, to);
        }
    }
}

/// An admitted call that must be settled with its outcome.
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Record a successful call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record(true, self.probe);
    }

    /// Record a failed call.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record(false, self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::assert_ok;

    #[derive(Debug, thiserror::Error)]
    #[error("upstream exploded")]
    struct Boom;

    fn breaker_at(start_ms: u64, threshold: u32, reset_timeout_ms: u64) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new(start_ms);
        let breaker = CircuitBreaker::with_config(
            "upstream",
            BreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms,
                max_half_open_probes: 1,
            },
        )
        .with_clock(Arc::new(clock.clone()));
        (breaker, clock)
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.execute::<(), _, _, _>(|| async { Err(Boom) }).await;
    }

    #[tokio::test]
    async fn test_initial_state_is_closed() {
        let (breaker, _) = breaker_at(0, 3, 5_000);
        let snapshot = breaker.snapshot();

        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.opened_at_ms, None);
    }

    #[tokio::test]
    async fn test_opens_after_exactly_threshold_failures() {
        let (breaker, _) = breaker_at(1_000, 3, 5_000);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail(&breaker).await;
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.opened_at_ms, Some(1_000));
    }

    #[tokio::test]
    async fn test_success_resets_the_failure_count() {
        let (breaker, _) = breaker_at(0, 3, 5_000);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_ok!(breaker.execute::<_, Boom, _, _>(|| async { Ok(1) }).await);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_invoking_the_operation() {
        let (breaker, clock) = breaker_at(0, 3, 5_000);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        clock.advance(1_000);
        let invoked = AtomicU32::new(0);
        let result = breaker
            .execute::<(), _, _, _>(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Err(Boom) }
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match result {
            Err(BreakerError::Open { retry_in_ms, .. }) => assert_eq!(retry_in_ms, 4_000),
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_admitted_after_reset_timeout_and_success_closes() {
        let (breaker, clock) = breaker_at(0, 3, 5_000);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        clock.advance(6_000);
        let result = breaker.execute::<_, Boom, _, _>(|| async { Ok("ok") }).await;

        assert_ok!(result);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.opened_at_ms, None);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens_with_fresh_timestamp() {
        let (breaker, clock) = breaker_at(0, 3, 5_000);
        for _ in 0..3 {
            fail(&breaker).await;
        }

        clock.advance(6_000);
        fail(&breaker).await;

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(snapshot.opened_at_ms, Some(6_000));

        // The fresh window holds: still failing fast at +4s
        clock.advance(4_000);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_probes() {
        let (breaker, clock) = breaker_at(0, 1, 5_000);
        fail(&breaker).await;
        clock.advance(5_000);

        let probe = breaker.try_acquire().unwrap();
        let Err(refused) = breaker.try_acquire() else {
            panic!("second probe should be refused");
        };
        assert_eq!(refused.retry_in_ms, 0);

        // Settling the probe frees the slot
        probe.failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_abandoned_probe_releases_its_slot() {
        let (breaker, clock) = breaker_at(0, 1, 5_000);
        fail(&breaker).await;
        clock.advance(5_000);

        {
            let _abandoned = breaker.try_acquire().unwrap();
        }

        // The slot is free again and the state is still half-open
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_benign_errors_do_not_trip_the_breaker() {
        let (breaker, _) = breaker_at(0, 2, 5_000);

        for _ in 0..5 {
            let result = breaker
                .execute_with::<(), _, _, _, _>(|| async { Err(Boom) }, |_| false)
                .await;
            assert!(matches!(result, Err(BreakerError::Inner(_))));
        }

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_transition_callback_observes_the_cycle() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let observed = transitions.clone();

        let clock = ManualClock::new(0);
        let breaker = CircuitBreaker::with_config(
            "upstream",
            BreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 1_000,
                max_half_open_probes: 1,
            },
        )
        .with_clock(Arc::new(clock.clone()))
        .on_transition(move |_, from, to| observed.lock().push((from, to)));

        fail(&breaker).await;
        clock.advance(1_000);
        assert_ok!(breaker.execute::<_, Boom, _, _>(|| async { Ok(()) }).await);

        assert_eq!(
            *transitions.lock(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn test_reset_closes_an_open_circuit() {
        let (breaker, _) = breaker_at(0, 1, 5_000);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }
}
