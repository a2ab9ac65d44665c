//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "BOXD_EXPORT_";

/// Longest accepted cache TTL (one year)
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry pacing configuration
    pub backoff: BackoffConfig,
    /// Client-side rate limiting
    pub rate_limit: RateLimitConfig,
    /// Response cache configuration
    pub cache: CacheConfig,
    /// Worker pool configuration
    pub worker_pool: WorkerPoolConfig,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Enable circuit breaker
    pub enabled: bool,
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Probe successes needed in half-open to close
    pub success_threshold: u32,
    /// Concurrent probe calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Per-call timeout (zero disables the timeout)
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Time after the last failure before a probe is admitted
    #[serde(with = "humantime_serde")]
    pub recovery_time: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            success_threshold: 1,
            half_open_max_calls: 1,
            call_timeout: Duration::from_secs(30),
            recovery_time: Duration::from_secs(60),
        }
    }
}

/// Backoff growth strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial * multiplier^attempt`
    #[default]
    Exponential,
    /// `initial + step * attempt`
    Linear,
}

/// Retry pacing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Growth strategy
    pub strategy: BackoffStrategy,
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Exponential growth factor
    pub multiplier: f64,
    /// Linear increment per attempt
    #[serde(with = "humantime_serde")]
    pub step: Duration,
    /// Add ±10% random jitter
    pub jitter: bool,
    /// Retries after the initial attempt
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            step: Duration::from_secs(1),
            jitter: true,
            max_retries: 3,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting
    pub enabled: bool,
    /// Sustained requests per second
    pub requests_per_second: u32,
    /// Burst size
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: 10,
            burst_size: 5,
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,
    /// Estimated memory budget in bytes (0 = unbounded)
    pub max_memory_bytes: usize,
    /// Entry time-to-live
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Interval for the caller-driven expiry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_memory_bytes: 0,
            ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Per-job timeout (zero disables the timeout)
    #[serde(with = "humantime_serde")]
    pub job_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            job_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the engine cannot run with
    ///
    /// Degenerate but safe values (`multiplier = 0`, `max_retries = 0`) pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let multiplier = self.backoff.multiplier;
        if !multiplier.is_finite() || multiplier < 0.0 {
            return Err(Error::Config(format!(
                "backoff.multiplier must be a finite non-negative number, got {multiplier}"
            )));
        }
        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(Error::Config(
                "backoff.max_delay must not be shorter than backoff.initial_delay".into(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be at least 1".into()));
        }
        if self.cache.ttl > MAX_CACHE_TTL {
            return Err(Error::Config(format!(
                "cache.ttl must not exceed {}",
                humantime_serde::format_duration(MAX_CACHE_TTL)
            )));
        }
        if self.worker_pool.worker_count == 0 {
            return Err(Error::Config("worker_pool.worker_count must be at least 1".into()));
        }
        if self.worker_pool.queue_capacity == 0 {
            return Err(Error::Config(
                "worker_pool.queue_capacity must be at least 1".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_second == 0 {
            return Err(Error::Config(
                "rate_limit.requests_per_second must be at least 1 when enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Serde helper for human-readable durations (`"250ms"`, `"30s"`, `"5m"`, `"1h"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to the shortest exact unit
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    /// Deserialize a duration string; bare numbers are seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Format a duration using the largest unit that represents it exactly
    #[must_use]
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis == 0 || millis % 1000 != 0 {
            return format!("{millis}ms");
        }
        let secs = duration.as_secs();
        if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a message describing the malformed input.
    pub fn parse_duration(input: &str) -> Result<Duration, String> {
        let s = input.trim();
        let parse = |n: &str| {
            n.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{input}': {e}"))
        };

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|m| Duration::from_secs(m.saturating_mul(60)))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours).map(|h| Duration::from_secs(h.saturating_mul(3600)))
        } else {
            parse(s).map(Duration::from_secs)
        }
    }
}
