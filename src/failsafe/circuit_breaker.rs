//! Circuit breaker implementation
//!
//! Closed → Open after `failure_threshold` consecutive failures. Open →
//! HalfOpen lazily, on the first admission attempt once `recovery_time` has
//! passed since the last failure. HalfOpen admits up to
//! `half_open_max_calls` probes; one failure reopens, `success_threshold`
//! successes close.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (blocking requests)
    Open,
    /// Circuit is half-open (allowing limited requests to test)
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

/// Mutable state, only touched under the mutex
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_failure: Option<Instant>,
    last_transition: Instant,
}

/// Circuit breaker guarding one downstream resource
pub struct CircuitBreaker {
    /// Resource name
    name: String,
    enabled: bool,
    failure_threshold: u32,
    success_threshold: u32,
    half_open_max_calls: u32,
    call_timeout: Duration,
    recovery_time: Duration,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    total_timeouts: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            half_open_max_calls: config.half_open_max_calls.max(1),
            call_timeout: config.call_timeout,
            recovery_time: config.recovery_time,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_failure: None,
                last_transition: Instant::now(),
            }),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Report rejections and timeouts to shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resource name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` through the breaker with the configured call timeout
    ///
    /// A timed-out operation is dropped and counted as a failure.
    ///
    /// # Errors
    ///
    /// [`Error::CircuitOpen`] when rejected (the operation is not polled),
    /// [`Error::Timeout`] when the call exceeds `call_timeout`, otherwise the
    /// operation's own error unchanged.
    pub async fn call<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;

        let outcome = if self.call_timeout.is_zero() {
            operation.await
        } else {
            match tokio::time::timeout(self.call_timeout, operation).await {
                Ok(result) => result,
                Err(_) => {
                    self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_timeout();
                    }
                    Err(Error::Timeout(self.call_timeout))
                }
            }
        };

        match outcome {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(e)
            }
        }
    }

    /// Ask for admission
    ///
    /// The returned permit must be resolved with [`CallPermit::success`] or
    /// [`CallPermit::failure`]; dropping it unresolved frees its probe slot
    /// without recording an outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`] while the circuit is open or every
    /// half-open probe slot is taken.
    #[tracing::instrument(skip(self), fields(breaker = %self.name))]
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.enabled {
            return Ok(CallPermit::new(self, false));
        }

        let mut inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                tracing::trace!("Circuit closed, allowing request");
                Ok(CallPermit::new(self, false))
            }
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(self.recovery_time, |t| t.elapsed());
                if elapsed >= self.recovery_time {
                    debug!("Recovery time elapsed, transitioning to half-open");
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    Ok(CallPermit::new(self, true))
                } else {
                    let retry_in = self.recovery_time.saturating_sub(elapsed);
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    Err(self.reject(failures, retry_in))
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    debug!(in_flight = inner.half_open_in_flight, "Circuit half-open, allowing probe request");
                    Ok(CallPermit::new(self, true))
                } else {
                    let failures = inner.consecutive_failures;
                    drop(inner);
                    Err(self.reject(failures, Duration::ZERO))
                }
            }
        }
    }

    /// Whether a call would be admitted right now, without taking a slot
    #[must_use]
    pub fn can_proceed(&self) -> bool {
        if !self.enabled {
            return true;
        }
        let inner = self.inner.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                inner.last_failure.is_none_or(|t| t.elapsed() >= self.recovery_time)
            }
            CircuitState::HalfOpen => inner.half_open_in_flight < self.half_open_max_calls,
        }
    }

    /// Record a successful call made outside [`CircuitBreaker::call`]
    ///
    /// Only probe permits count toward closing a half-open circuit.
    pub fn record_success(&self) {
        self.on_success(false);
    }

    /// Record a failed call made outside [`CircuitBreaker::call`]
    pub fn record_failure(&self) {
        self.on_failure(false);
    }

    /// Get current state
    ///
    /// An open circuit reports `Open` until the next admission attempt, even
    /// if its recovery time has passed.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Force the breaker back to closed and clear failure history
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.last_failure = None;
        info!(breaker = %self.name, "Circuit breaker reset by operator");
    }

    /// Statistics snapshot
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn stats(&self) -> CircuitBreakerStats {
        let (state, consecutive_failures, last_failure_ago_ms, in_state_ms) = {
            let inner = self.inner.lock();
            (
                inner.state,
                inner.consecutive_failures,
                inner.last_failure.map(|t| t.elapsed().as_millis() as u64),
                inner.last_transition.elapsed().as_millis() as u64,
            )
        };
        let successes = self.total_successes.load(Ordering::Relaxed);
        let failures = self.total_failures.load(Ordering::Relaxed);
        let completed = successes + failures;

        CircuitBreakerStats {
            name: self.name.clone(),
            state,
            consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: successes,
            total_failures: failures,
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            failure_rate: if completed == 0 {
                0.0
            } else {
                failures as f64 / completed as f64
            },
            last_failure_ago_ms,
            in_state_ms,
        }
    }

    /// Operator-facing description of the breaker
    #[must_use]
    pub fn status_message(&self) -> String {
        if !self.enabled {
            return format!("Resource '{}' is available (circuit breaker disabled, closed)", self.name);
        }
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => format!("Resource '{}' is available (circuit closed)", self.name),
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(self.recovery_time, |t| t.elapsed());
                let retry_in = self.recovery_time.saturating_sub(elapsed);
                format!(
                    "Resource '{}' is unavailable: circuit breaker is open after {} failures, retry in {} seconds",
                    self.name,
                    inner.consecutive_failures,
                    retry_in.as_secs()
                )
            }
            CircuitState::HalfOpen => format!(
                "Resource '{}' is {}: testing recovery with {} probe(s) in flight",
                self.name,
                CircuitState::HalfOpen.as_str(),
                inner.half_open_in_flight
            ),
        }
    }

    fn reject(&self, failures: u32, retry_in: Duration) -> Error {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_rejection(&self.name);
        }
        warn!(breaker = %self.name, failures, retry_in_ms = retry_in.as_millis() as u64, "Circuit open, rejecting request");
        Error::CircuitOpen {
            name: self.name.clone(),
            failures,
            retry_in,
        }
    }

    fn on_success(&self, probe: bool) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        let state = inner.state;
        match state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                tracing::trace!("Success in closed state, reset failure count");
            }
            CircuitState::HalfOpen if !probe => {
                tracing::trace!("Late success from a pre-open call in half-open state (ignored)");
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    successes = inner.half_open_successes,
                    threshold = self.success_threshold,
                    "Success in half-open state"
                );
                if inner.half_open_successes >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {
                tracing::trace!("Late success recorded in open state (ignored)");
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        if !self.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        if probe {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    threshold = self.failure_threshold,
                    "Failure in closed state"
                );
                if inner.consecutive_failures >= self.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Failure in half-open state, reopening circuit");
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {
                tracing::trace!("Late failure recorded in open state");
            }
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
    }

    /// Move to `new_state`; caller holds the lock
    fn transition(&self, inner: &mut BreakerState, new_state: CircuitState) {
        if inner.state == new_state {
            return;
        }
        inner.state = new_state;
        inner.last_transition = Instant::now();

        match new_state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                info!(breaker = %self.name, "Circuit breaker closed");
            }
            CircuitState::Open => {
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    recovery_ms = self.recovery_time.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                debug!(breaker = %self.name, "Circuit breaker half-open");
            }
        }
    }
}

/// Admission ticket for one call
#[must_use = "resolve the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    resolved: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool) -> Self {
        Self {
            breaker,
            probe,
            resolved: false,
        }
    }

    /// Whether this call is a half-open probe
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Record that the call succeeded
    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    /// Record that the call failed
    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.probe && self.breaker.enabled {
            self.breaker.release_probe();
        }
    }
}

/// Circuit breaker statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Admission attempts (including rejected ones)
    pub total_calls: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls that failed (timeouts included)
    pub total_failures: u64,
    /// Calls rejected without running
    pub total_rejections: u64,
    /// Calls that hit the call timeout
    pub total_timeouts: u64,
    /// failures / completed calls (0.0-1.0)
    pub failure_rate: f64,
    /// Milliseconds since the last failure
    pub last_failure_ago_ms: Option<u64>,
    /// Milliseconds since the last state change
    pub in_state_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(threshold: u32, recovery: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            success_threshold: 1,
            half_open_max_calls: 1,
            call_timeout: Duration::from_secs(5),
            recovery_time: recovery,
        }
    }

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::new("api", &CircuitBreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_proceed());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("api", &config(3, Duration::from_secs(60)));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(Error::CircuitOpen { failures: 3, .. })));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("api", &config(3, Duration::from_secs(60)));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_after_recovery() {
        let cb = CircuitBreaker::new("api", &config(2, Duration::from_millis(20)));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));

        // Transition is lazy
        assert_eq!(cb.state(), CircuitState::Open);
        let permit = cb.try_acquire().unwrap();
        assert!(permit.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Single probe slot is taken
        assert!(cb.try_acquire().is_err());

        permit.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_pre_open_success_does_not_close_half_open() {
        let cb = CircuitBreaker::new("api", &config(1, Duration::from_millis(10)));
        let slow = cb.try_acquire().unwrap();
        assert!(!slow.is_probe());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(20));

        let probe = cb.try_acquire().unwrap();
        assert!(probe.is_probe());

        // The call admitted while closed finishes late
        slow.success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_err());

        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("api", &config(2, Duration::from_millis(20)));
        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_dropped_probe_frees_slot() {
        let cb = CircuitBreaker::new("api", &config(1, Duration::from_millis(10)));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let permit = cb.try_acquire().unwrap();
        drop(permit);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().is_ok());
    }

    #[test]
    fn test_success_threshold_requires_multiple_probes() {
        let mut cfg = config(1, Duration::from_millis(10));
        cfg.success_threshold = 2;
        cfg.half_open_max_calls = 2;
        let cb = CircuitBreaker::new("api", &cfg);
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        let first = cb.try_acquire().unwrap();
        let second = cb.try_acquire().unwrap();
        first.success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        second.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new("api", &config(1, Duration::from_secs(60)));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
        assert!(cb.can_proceed());
    }

    #[tokio::test]
    async fn test_call_counts_and_rejects_without_invoking() {
        let cb = CircuitBreaker::new("api", &config(2, Duration::from_secs(60)));
        let invocations = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = cb
                .call(async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::Unavailable("503".into()))
                })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        let result = cb
            .call(async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        let stats = cb.stats();
        assert_eq!(stats.total_calls, 4);
        assert_eq!(stats.total_failures, 2);
        assert_eq!(stats.total_rejections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let mut cfg = config(1, Duration::from_secs(60));
        cfg.call_timeout = Duration::from_millis(50);
        let cb = CircuitBreaker::new("slow", &cfg);

        let result = cb
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_millis(50)));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_operation_error_passes_through() {
        let cb = CircuitBreaker::new("api", &config(5, Duration::from_secs(60)));
        let result = cb.call(async { Err::<(), _>(Error::Auth("expired token".into())) }).await;
        assert!(matches!(result, Err(Error::Auth(msg)) if msg == "expired token"));
    }

    #[test]
    fn test_disabled_never_opens() {
        let mut cfg = config(1, Duration::from_secs(60));
        cfg.enabled = false;
        let cb = CircuitBreaker::new("off", &cfg);
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.stats().total_failures, 10);
    }
}
