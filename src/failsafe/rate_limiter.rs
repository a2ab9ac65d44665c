//! Client-side rate limiting for outbound calls

use std::num::NonZeroU32;

use governor::{
    Quota, RateLimiter as GovernorLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};

use crate::config::RateLimitConfig;
use crate::{Error, Result};

/// Token-bucket limiter shared by every caller of one remote API
pub struct RateLimiter {
    limiter: Option<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    rps: u32,
}

impl RateLimiter {
    /// Create a new rate limiter; a disabled config admits everything
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = config.enabled.then(|| {
            let quota = Quota::per_second(
                NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN),
            )
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));
            GovernorLimiter::direct(quota)
        });

        Self {
            limiter,
            rps: config.requests_per_second,
        }
    }

    /// Whether limiting is active
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Try to take a permit without waiting
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }

    /// Take a permit or fail with a retryable [`Error::RateLimited`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] when the bucket is empty.
    pub fn acquire(&self) -> Result<()> {
        if self.try_acquire() {
            Ok(())
        } else {
            Err(Error::RateLimited(format!(
                "client limit of {} requests/s reached",
                self.rps
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = RateLimiter::new(&RateLimitConfig::default());
        assert!(!limiter.is_enabled());
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_second: 1,
            burst_size: 3,
        });

        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());
        assert!(limiter.acquire().is_ok());

        let err = limiter.acquire().unwrap_err();
        assert!(matches!(err, Error::RateLimited(_)));
        assert!(err.is_retryable());
    }
}
