//! boxd-export resilience engine
//!
//! Protects outbound calls to a remote API from transient failure and
//! overload, and amortizes repeated calls.
//!
//! # Features
//!
//! - **Circuit Breaker**: closed/open/half-open state machine with probe limits
//! - **Backoff**: exponential and linear strategies with optional jitter
//! - **Retry Client**: breaker + backoff + error classification + cancellation
//! - **LRU Cache**: TTL expiry, entry limit, approximate memory budget
//! - **Worker Pool**: bounded queue, fixed workers, panic and timeout isolation
//! - **Metrics**: lock-free counters and duration percentiles

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod failsafe;
pub mod metrics;
pub mod pool;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level` when set.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    }
    .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}
