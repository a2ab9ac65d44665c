//! Error types for the resilience engine
//!
//! Every error belongs to exactly one [`ErrorCategory`]. Retryability is
//! derived from the variant, so the retry classifier never has to guess.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for the resilience engine
pub type Result<T> = std::result::Result<T, Error>;

/// Broad error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Remote side misbehaved or could not be reached
    Network,
    /// The operation itself failed, was canceled, or gave up
    Operation,
    /// Local resources exhausted (queue full, pool stopped)
    System,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Operation => "operation",
            Self::System => "system",
        })
    }
}

/// Why the retry client stopped trying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The circuit breaker rejected the call
    ServiceUnavailable,
    /// The classifier marked the error as permanent
    NonRetryable,
    /// Every allowed attempt failed
    MaxRetriesExceeded {
        /// Total attempts made (initial call included)
        attempts: u32,
    },
    /// The cancellation token fired
    Canceled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceUnavailable => f.write_str("service unavailable (circuit open)"),
            Self::NonRetryable => f.write_str("failed with non-retryable error"),
            Self::MaxRetriesExceeded { attempts } => {
                write!(f, "max retries exceeded after {attempts} attempts")
            }
            Self::Canceled => f.write_str("canceled"),
        }
    }
}

/// Resilience engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Call exceeded its timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Remote service reported itself unavailable (e.g. HTTP 503)
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Remote or local rate limit hit
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Connection refused by the remote host
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Host name could not be resolved
    #[error("DNS resolution failed for {host}")]
    Dns {
        /// Host that failed to resolve
        host: String,
        /// Permanent failure (NXDOMAIN) rather than a resolver hiccup
        permanent: bool,
    },

    /// Circuit breaker is open and rejected the call without running it
    #[error("Circuit breaker '{name}' is open ({failures} consecutive failures, retry in {retry_in:?})")]
    CircuitOpen {
        /// Breaker name
        name: String,
        /// Consecutive failures that opened the circuit
        failures: u32,
        /// Time until the next probe is admitted
        retry_in: Duration,
    },

    /// Operation was canceled
    #[error("Operation canceled")]
    Canceled,

    /// Generic operation failure
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Failure explicitly tagged as transient
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Failure explicitly tagged as permanent
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Bad credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed request input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Worker pool queue is full
    #[error("Job queue full (capacity {capacity})")]
    QueueFull {
        /// Queue capacity
        capacity: usize,
    },

    /// Worker pool is not accepting jobs
    #[error("Worker pool is not running")]
    PoolStopped,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Terminal failure surfaced by the retry client
    #[error("Operation '{operation}' {reason}: {source}")]
    Terminal {
        /// Operation name given to the retry client
        operation: String,
        /// Why retrying stopped
        reason: FailureReason,
        /// Last underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Category of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout(_)
            | Self::Unavailable(_)
            | Self::RateLimited(_)
            | Self::ConnectionRefused(_)
            | Self::Dns { .. }
            | Self::CircuitOpen { .. } => ErrorCategory::Network,
            Self::Io(e) => io_category(e),
            Self::QueueFull { .. } | Self::PoolStopped | Self::Config(_) => ErrorCategory::System,
            Self::Terminal { reason, source, .. } => match reason {
                FailureReason::ServiceUnavailable => ErrorCategory::Network,
                FailureReason::NonRetryable => source.category(),
                FailureReason::MaxRetriesExceeded { .. } | FailureReason::Canceled => {
                    ErrorCategory::Operation
                }
            },
            Self::Canceled
            | Self::Failed(_)
            | Self::Transient(_)
            | Self::Permanent(_)
            | Self::Auth(_)
            | Self::InvalidInput(_)
            | Self::Json(_) => ErrorCategory::Operation,
        }
    }

    /// Whether this error is transient by default
    ///
    /// Network errors retry except permanent DNS failures and open circuits
    /// (the breaker's own recovery timer governs those). Cancellation and
    /// explicitly permanent errors never retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::Unavailable(_)
            | Self::RateLimited(_)
            | Self::ConnectionRefused(_)
            | Self::Transient(_) => true,
            Self::Dns { permanent, .. } => !permanent,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether this error (or the terminal wrapper) means cancellation
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Terminal { reason, .. } => *reason == FailureReason::Canceled,
            _ => false,
        }
    }

    /// Terminal reason, if this error came out of the retry client
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Terminal { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Innermost error, unwrapping nested terminal failures
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Self::Terminal { source, .. } = current {
            current = source;
        }
        current
    }
}

fn io_category(error: &io::Error) -> ErrorCategory {
    match error.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable => ErrorCategory::Network,
        io::ErrorKind::OutOfMemory => ErrorCategory::System,
        _ => ErrorCategory::Operation,
    }
}
