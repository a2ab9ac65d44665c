//! Retry pacing strategies

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;

use crate::config::{BackoffConfig, BackoffStrategy};

/// Jitter magnitude as a fraction of the computed delay
pub const JITTER_FACTOR: f64 = 0.1;

/// Computes the wait before each retry and decides when to stop
///
/// `attempt` is zero-based: `delay(0)` is the wait after the first failure.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay before retry number `attempt + 1`
    fn delay(&self, attempt: u32) -> Duration;

    /// Whether another retry is allowed after `attempt` failed
    fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries()
    }

    /// Retries allowed after the initial attempt
    fn max_retries(&self) -> u32;
}

/// Build the configured strategy
#[must_use]
pub fn from_config(config: &BackoffConfig) -> Arc<dyn Backoff> {
    match config.strategy {
        BackoffStrategy::Exponential => Arc::new(ExponentialBackoff::from_config(config)),
        BackoffStrategy::Linear => Arc::new(LinearBackoff::from_config(config)),
    }
}

/// `min(initial * multiplier^attempt, max)` with optional ±10% jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    max_retries: u32,
}

impl ExponentialBackoff {
    /// Create a strategy without jitter
    ///
    /// A negative or NaN multiplier is treated as zero, which makes every
    /// delay after the first collapse to zero instead of panicking.
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: f64, max_retries: u32) -> Self {
        let multiplier = if multiplier.is_nan() { 0.0 } else { multiplier.max(0.0) };
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            multiplier,
            jitter: false,
            max_retries,
        }
    }

    /// Create from config
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.initial_delay,
            config.max_delay,
            config.multiplier,
            config.max_retries,
        )
        .with_jitter(config.jitter)
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before jitter is applied
    #[must_use]
    #[allow(
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let max_nanos = self.max_delay.as_nanos() as f64;
        // f64::min ignores NaN from 0 * inf
        let nanos = (self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent))
            .min(max_nanos);
        if nanos >= max_nanos {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            apply_jitter(base, JITTER_FACTOR)
        } else {
            base
        }
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// `min(initial + step * attempt, max)` with optional ±10% jitter
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    initial_delay: Duration,
    step: Duration,
    max_delay: Duration,
    jitter: bool,
    max_retries: u32,
}

impl LinearBackoff {
    /// Create a strategy without jitter
    #[must_use]
    pub fn new(initial_delay: Duration, step: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            step,
            max_delay: max_delay.max(initial_delay),
            jitter: false,
            max_retries,
        }
    }

    /// Create from config
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(
            config.initial_delay,
            config.step,
            config.max_delay,
            config.max_retries,
        )
        .with_jitter(config.jitter)
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before jitter is applied
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_add(self.step.saturating_mul(attempt))
            .min(self.max_delay)
    }
}

impl Backoff for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            apply_jitter(base, JITTER_FACTOR)
        } else {
            base
        }
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Offset `duration` by a uniform random fraction in `[-factor, factor]`
fn apply_jitter(duration: Duration, factor: f64) -> Duration {
    if duration.is_zero() || factor <= 0.0 {
        return duration;
    }
    let offset = rand::rng().random_range(-factor..=factor);
    let jittered = (duration.as_secs_f64() * (1.0 + offset)).max(0.0);
    Duration::try_from_secs_f64(jittered).unwrap_or(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(max_retries: u32) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            2.0,
            max_retries,
        )
    }

    #[test]
    fn test_first_delay_is_initial() {
        let backoff = exponential(3);
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delays_monotonic_and_capped() {
        let backoff = exponential(100);
        let mut previous = Duration::ZERO;
        for attempt in 0..100 {
            let delay = backoff.delay(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }
        assert_eq!(backoff.delay(99), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = exponential(3);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = exponential(10).with_jitter(true);
        for attempt in 0..6 {
            let base = backoff.base_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = backoff.delay(attempt).as_secs_f64();
                assert!(delay >= base * 0.9 - 1e-9, "{delay} below {base}");
                assert!(delay <= base * 1.1 + 1e-9, "{delay} above {base}");
            }
        }
    }

    #[test]
    fn test_should_retry_bounds() {
        let backoff = exponential(3);
        assert!(backoff.should_retry(0));
        assert!(backoff.should_retry(2));
        assert!(!backoff.should_retry(3));
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let backoff = exponential(0);
        assert!(!backoff.should_retry(0));
    }

    #[test]
    fn test_zero_multiplier_collapses_delay() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            0.0,
            3,
        )
        .with_jitter(true);

        assert!(backoff.delay(0) <= Duration::from_millis(110));
        assert_eq!(backoff.delay(1), Duration::ZERO);
        assert_eq!(backoff.delay(50), Duration::ZERO);
    }

    #[test]
    fn test_negative_multiplier_treated_as_zero() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            -3.0,
            3,
        );
        assert_eq!(backoff.delay(1), Duration::ZERO);
    }

    #[test]
    fn test_linear_growth() {
        let backoff = LinearBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            Duration::from_millis(300),
            5,
        );
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(150));
        assert_eq!(backoff.delay(3), Duration::from_millis(250));
        assert_eq!(backoff.delay(10), Duration::from_millis(300));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(300));
    }

    #[test]
    fn test_from_config_selects_strategy() {
        let config = BackoffConfig {
            strategy: BackoffStrategy::Linear,
            initial_delay: Duration::from_millis(10),
            step: Duration::from_millis(10),
            jitter: false,
            ..BackoffConfig::default()
        };
        let backoff = from_config(&config);
        assert_eq!(backoff.delay(2), Duration::from_millis(30));
        assert_eq!(backoff.max_retries(), 3);
    }
}
