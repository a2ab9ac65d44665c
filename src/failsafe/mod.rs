//! Failsafe mechanisms: circuit breaker, backoff, retry client, rate limiting

pub mod backoff;
mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use backoff::{Backoff, ExponentialBackoff, LinearBackoff};
pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use rate_limiter::RateLimiter;
pub use retry::{RetryChecker, RetryClient, RetryStats, default_retry_checker};
