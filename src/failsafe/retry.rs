//! Retry client: circuit breaking, backoff, and cancellation around one call

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::backoff::{self, Backoff};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use super::rate_limiter::RateLimiter;
use crate::config::Config;
use crate::error::FailureReason;
use crate::metrics::Metrics;
use crate::{Error, Result};

/// Decides whether an error is worth another attempt
pub type RetryChecker = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Default classification
///
/// Retries timeouts, refused connections, transient DNS failures, rate
/// limiting, service-unavailable, and errors tagged [`Error::Transient`].
/// Never retries cancellation or permanent errors.
#[must_use]
pub fn default_retry_checker(error: &Error) -> bool {
    !error.is_canceled() && error.is_retryable()
}

/// Executes operations against one protected resource
pub struct RetryClient {
    name: String,
    breaker: Arc<CircuitBreaker>,
    backoff: Arc<dyn Backoff>,
    rate_limiter: Option<Arc<RateLimiter>>,
    retry_checker: RetryChecker,
    metrics: Option<Arc<Metrics>>,
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    rejections: AtomicU64,
    cancellations: AtomicU64,
}

impl RetryClient {
    /// Create a client around a shared breaker and a backoff strategy
    #[must_use]
    pub fn new(name: &str, breaker: Arc<CircuitBreaker>, backoff: Arc<dyn Backoff>) -> Self {
        Self {
            name: name.to_string(),
            breaker,
            backoff,
            rate_limiter: None,
            retry_checker: Arc::new(default_retry_checker),
            metrics: None,
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
        }
    }

    /// Build breaker, backoff, and rate limiter from configuration
    #[must_use]
    pub fn from_config(name: &str, config: &Config, metrics: Option<Arc<Metrics>>) -> Self {
        let mut breaker = CircuitBreaker::new(name, &config.circuit_breaker);
        if let Some(metrics) = &metrics {
            breaker = breaker.with_metrics(Arc::clone(metrics));
        }

        let mut client = Self::new(name, Arc::new(breaker), backoff::from_config(&config.backoff));
        if config.rate_limit.enabled {
            client = client.with_rate_limiter(Arc::new(RateLimiter::new(&config.rate_limit)));
        }
        if let Some(metrics) = metrics {
            client = client.with_metrics(metrics);
        }
        client
    }

    /// Replace the retry classifier
    #[must_use]
    pub fn with_retry_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_checker = Arc::new(checker);
        self
    }

    /// Gate every attempt behind a rate limiter
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Record attempts and retries into shared metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shared circuit breaker
    #[must_use]
    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `operation` until it succeeds, fails permanently, the circuit
    /// rejects it, retries run out, or `token` is canceled
    ///
    /// Attempts are strictly sequential. Cancellation is honored before each
    /// attempt, during the attempt, and during the backoff wait.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminal`] carrying `operation_name`, the reason, and
    /// the last underlying error.
    #[tracing::instrument(skip(self, token, operation), fields(client = %self.name))]
    pub async fn execute<F, Fut, T>(
        &self,
        token: &CancellationToken,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(self.canceled(operation_name, Error::Canceled));
            }

            let started = Instant::now();
            let result = match self.rate_limiter.as_ref().map(|l| l.acquire()) {
                Some(Err(e)) => Err(e),
                _ => {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            return Err(self.canceled(operation_name, Error::Canceled));
                        }
                        result = self.breaker.call(operation()) => result,
                    }
                }
            };

            let error = match result {
                Ok(value) => {
                    self.record_attempt(operation_name, started.elapsed(), true);
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 0 {
                        debug!(operation = operation_name, attempts = attempt + 1, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e @ Error::CircuitOpen { .. }) => {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        operation = operation_name,
                        error = %e,
                        "Downstream unavailable, circuit breaker rejected call"
                    );
                    return Err(self.terminal(operation_name, FailureReason::ServiceUnavailable, e));
                }
                Err(e) => {
                    self.record_attempt(operation_name, started.elapsed(), false);
                    e
                }
            };

            if !(self.retry_checker)(&error) {
                debug!(operation = operation_name, error = %error, "Non-retryable error");
                return Err(self.terminal(operation_name, FailureReason::NonRetryable, error));
            }

            if !self.backoff.should_retry(attempt) {
                let attempts = attempt.saturating_add(1);
                warn!(
                    operation = operation_name,
                    attempts,
                    error = %error,
                    "Retries exhausted, downstream failing intermittently"
                );
                return Err(self.terminal(
                    operation_name,
                    FailureReason::MaxRetriesExceeded { attempts },
                    error,
                ));
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                operation = operation_name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying after backoff"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);
            if let Some(metrics) = &self.metrics {
                metrics.record_retry(operation_name);
            }

            tokio::select! {
                biased;
                () = token.cancelled() => {
                    return Err(self.canceled(operation_name, error));
                }
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    /// [`RetryClient::execute`] with a deadline
    ///
    /// The deadline is a child of `token`, so either one firing cancels the
    /// execution.
    ///
    /// # Errors
    ///
    /// Same as [`RetryClient::execute`]; an expired deadline surfaces as a
    /// cancellation.
    pub async fn execute_with_timeout<F, Fut, T>(
        &self,
        token: &CancellationToken,
        timeout: Duration,
        operation_name: &str,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let deadline = token.child_token();
        let timer = {
            let deadline = deadline.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let result = self.execute(&deadline, operation_name, operation).await;
        timer.abort();
        result
    }

    /// Circuit breaker statistics
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Retry client counters plus breaker statistics
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn client_stats(&self) -> RetryStats {
        let executions = self.executions.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        RetryStats {
            name: self.name.clone(),
            executions,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            breaker_rejections: self.rejections.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            success_rate: if executions == 0 {
                0.0
            } else {
                successes as f64 / executions as f64
            },
            breaker: self.breaker.stats(),
        }
    }

    /// Force the shared breaker closed
    pub fn reset_circuit_breaker(&self) {
        self.breaker.reset();
    }

    fn record_attempt(&self, operation: &str, elapsed: Duration, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_call(operation, elapsed, success);
        }
    }

    fn canceled(&self, operation: &str, cause: Error) -> Error {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
        debug!(operation, "Execution canceled");
        self.terminal(operation, FailureReason::Canceled, cause)
    }

    fn terminal(&self, operation: &str, reason: FailureReason, cause: Error) -> Error {
        self.failures.fetch_add(1, Ordering::Relaxed);
        Error::Terminal {
            operation: operation.to_string(),
            reason,
            source: Box::new(cause),
        }
    }
}

/// Retry client statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    /// Client name
    pub name: String,
    /// `execute` calls
    pub executions: u64,
    /// Executions that returned success
    pub successes: u64,
    /// Executions that returned an error (cancellations included)
    pub failures: u64,
    /// Retries scheduled
    pub retries: u64,
    /// Executions stopped by an open circuit
    pub breaker_rejections: u64,
    /// Executions stopped by cancellation
    pub cancellations: u64,
    /// successes / executions (0.0-1.0)
    pub success_rate: f64,
    /// Breaker snapshot
    pub breaker: CircuitBreakerStats,
}
