//! Performance metrics shared by the resilience components
//!
//! Counters are lock-free atomics. Recent durations live in fixed-size
//! ring buffers so percentile queries never grow memory. Every update is
//! also forwarded to the `metrics` facade, which is a no-op unless the
//! host installs a recorder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use telemetry_metrics::{counter, histogram};

/// Default number of duration samples kept per ring
pub const DEFAULT_RING_CAPACITY: usize = 1000;

/// Number of operations reported in a snapshot
const TOP_OPERATIONS: usize = 10;

/// Distinct operation names tracked individually
///
/// Operation names are meant to come from a fixed set. Once this many are
/// known, calls under new names are counted under [`OVERFLOW_OPERATION`].
/// Concurrent first-time inserts may overshoot the limit slightly.
pub const MAX_TRACKED_OPERATIONS: usize = 256;

/// Bucket for calls whose operation name arrived past the tracking limit
pub const OVERFLOW_OPERATION: &str = "_other";

/// Fixed-capacity circular buffer of durations
///
/// Once full, each `add` overwrites the oldest sample.
pub struct DurationRing {
    inner: Mutex<Ring>,
}

struct Ring {
    samples: Vec<Duration>,
    /// Slot the next sample is written to
    next: usize,
    capacity: usize,
}

impl DurationRing {
    /// Create a ring holding at most `capacity` samples (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Ring {
                samples: Vec::with_capacity(capacity),
                next: 0,
                capacity,
            }),
        }
    }

    /// Record a sample
    pub fn add(&self, duration: Duration) {
        let mut ring = self.inner.lock();
        let slot = ring.next;
        if ring.samples.len() < ring.capacity {
            ring.samples.push(duration);
        } else {
            ring.samples[slot] = duration;
        }
        ring.next = (slot + 1) % ring.capacity;
    }

    /// Number of samples currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    /// Whether no samples have been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().samples.is_empty()
    }

    /// Maximum number of samples held
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Mean of current samples (zero when empty)
    #[must_use]
    pub fn average(&self) -> Duration {
        let ring = self.inner.lock();
        if ring.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: u128 = ring.samples.iter().map(Duration::as_nanos).sum();
        let mean = total / ring.samples.len() as u128;
        Duration::from_nanos(u64::try_from(mean).unwrap_or(u64::MAX))
    }

    /// Smallest current sample (zero when empty)
    #[must_use]
    pub fn min(&self) -> Duration {
        self.inner
            .lock()
            .samples
            .iter()
            .min()
            .copied()
            .unwrap_or_default()
    }

    /// Largest current sample (zero when empty)
    #[must_use]
    pub fn max(&self) -> Duration {
        self.inner
            .lock()
            .samples
            .iter()
            .max()
            .copied()
            .unwrap_or_default()
    }

    /// Most recently added sample (zero when empty)
    #[must_use]
    pub fn latest(&self) -> Duration {
        let ring = self.inner.lock();
        let len = ring.samples.len();
        if len == 0 {
            return Duration::ZERO;
        }
        ring.samples[(ring.next + len - 1) % len]
    }

    /// Percentile `p` in `[0, 100]`, linearly interpolated
    ///
    /// Returns zero for an empty ring or an out-of-range `p`.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn percentile(&self, p: f64) -> Duration {
        if !(0.0..=100.0).contains(&p) {
            return Duration::ZERO;
        }

        // Sort a copy outside the lock
        let mut sorted = self.inner.lock().samples.clone();
        if sorted.is_empty() {
            return Duration::ZERO;
        }
        sorted.sort_unstable();

        let rank = p / 100.0 * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return sorted[lower];
        }

        let low = sorted[lower].as_secs_f64();
        let high = sorted[upper].as_secs_f64();
        let value = low + (high - low) * (rank - lower as f64);
        Duration::try_from_secs_f64(value).unwrap_or(sorted[upper])
    }

    /// Drop all samples
    pub fn clear(&self) {
        let mut ring = self.inner.lock();
        ring.samples.clear();
        ring.next = 0;
    }
}

impl Default for DurationRing {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

/// Aggregate counters for calls, cache lookups, and jobs
pub struct Metrics {
    calls: AtomicU64,
    successes: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    breaker_rejections: AtomicU64,
    timeouts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    jobs_processed: AtomicU64,
    jobs_errored: AtomicU64,
    call_durations: DurationRing,
    job_durations: DurationRing,
    /// Per-operation call counts
    operations: DashMap<String, AtomicU64>,
}

impl Metrics {
    /// Create metrics with the default ring capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RING_CAPACITY)
    }

    /// Create metrics keeping `capacity` duration samples per ring
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            jobs_processed: AtomicU64::new(0),
            jobs_errored: AtomicU64::new(0),
            call_durations: DurationRing::new(capacity),
            job_durations: DurationRing::new(capacity),
            operations: DashMap::new(),
        }
    }

    /// Record one attempt of a protected call
    pub fn record_call(&self, operation: &str, duration: Duration, success: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.call_durations.add(duration);

        let operation = self.count_operation(operation);

        let outcome = if success { "success" } else { "error" };
        counter!("boxd_export_calls_total", "operation" => operation.to_string(), "outcome" => outcome)
            .increment(1);
        histogram!("boxd_export_call_duration_seconds", "operation" => operation.to_string())
            .record(duration.as_secs_f64());
    }

    /// Bump the per-operation count; returns the name it was counted under
    fn count_operation<'a>(&self, operation: &'a str) -> &'a str {
        if let Some(count) = self.operations.get(operation) {
            count.fetch_add(1, Ordering::Relaxed);
            return operation;
        }
        let key = if self.operations.len() >= MAX_TRACKED_OPERATIONS {
            OVERFLOW_OPERATION
        } else {
            operation
        };
        self.operations
            .entry(key.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        key
    }

    /// Record a scheduled retry
    pub fn record_retry(&self, operation: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        counter!("boxd_export_retries_total", "operation" => operation.to_string()).increment(1);
    }

    /// Record a call rejected by an open circuit
    pub fn record_breaker_rejection(&self, breaker: &str) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
        counter!("boxd_export_breaker_rejections_total", "breaker" => breaker.to_string())
            .increment(1);
    }

    /// Record a call that exceeded its timeout
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("boxd_export_timeouts_total").increment(1);
    }

    /// Record a cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        counter!("boxd_export_cache_hits_total").increment(1);
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        counter!("boxd_export_cache_misses_total").increment(1);
    }

    /// Record a finished worker-pool job
    pub fn record_job(&self, duration: Duration, success: bool) {
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.jobs_errored.fetch_add(1, Ordering::Relaxed);
        }
        self.job_durations.add(duration);

        let outcome = if success { "success" } else { "error" };
        counter!("boxd_export_jobs_total", "outcome" => outcome).increment(1);
        histogram!("boxd_export_job_duration_seconds").record(duration.as_secs_f64());
    }

    /// Recent call durations
    #[must_use]
    pub fn call_durations(&self) -> &DurationRing {
        &self.call_durations
    }

    /// Recent job durations
    #[must_use]
    pub fn job_durations(&self) -> &DurationRing {
        &self.job_durations
    }

    /// Calls recorded for one operation
    pub fn operation_calls(&self, operation: &str) -> u64 {
        self.operations
            .get(operation)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Point-in-time snapshot with derived ratios
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self.calls.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = cache_hits + cache_misses;

        let mut top_operations: Vec<OperationCount> = self
            .operations
            .iter()
            .map(|entry| OperationCount {
                operation: entry.key().clone(),
                calls: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        top_operations.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.operation.cmp(&b.operation)));
        top_operations.truncate(TOP_OPERATIONS);

        MetricsSnapshot {
            calls,
            successes: self.successes.load(Ordering::Relaxed),
            errors,
            error_rate: if calls == 0 { 0.0 } else { errors as f64 / calls as f64 },
            retries: self.retries.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                cache_hits as f64 / lookups as f64
            },
            jobs_processed: self.jobs_processed.load(Ordering::Relaxed),
            jobs_errored: self.jobs_errored.load(Ordering::Relaxed),
            call_latency: LatencySummary::from_ring(&self.call_durations),
            job_latency: LatencySummary::from_ring(&self.job_durations),
            top_operations,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency figures in milliseconds
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencySummary {
    /// Samples held
    pub samples: usize,
    /// Mean
    pub avg_ms: f64,
    /// Minimum
    pub min_ms: f64,
    /// Maximum
    pub max_ms: f64,
    /// Median
    pub p50_ms: f64,
    /// 95th percentile
    pub p95_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
}

impl LatencySummary {
    /// Summarize a ring buffer
    #[must_use]
    pub fn from_ring(ring: &DurationRing) -> Self {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        Self {
            samples: ring.len(),
            avg_ms: ms(ring.average()),
            min_ms: ms(ring.min()),
            max_ms: ms(ring.max()),
            p50_ms: ms(ring.percentile(50.0)),
            p95_ms: ms(ring.percentile(95.0)),
            p99_ms: ms(ring.percentile(99.0)),
        }
    }
}

/// Calls recorded for one operation
#[derive(Debug, Clone, Serialize)]
pub struct OperationCount {
    /// Operation name
    pub operation: String,
    /// Calls recorded
    pub calls: u64,
}

/// Snapshot of [`Metrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Call attempts
    pub calls: u64,
    /// Successful attempts
    pub successes: u64,
    /// Failed attempts
    pub errors: u64,
    /// errors / calls (0.0-1.0)
    pub error_rate: f64,
    /// Retries scheduled
    pub retries: u64,
    /// Calls rejected by an open circuit
    pub breaker_rejections: u64,
    /// Calls that timed out
    pub timeouts: u64,
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// hits / lookups (0.0-1.0)
    pub cache_hit_rate: f64,
    /// Jobs finished by the worker pool
    pub jobs_processed: u64,
    /// Jobs that failed, panicked, or timed out
    pub jobs_errored: u64,
    /// Call latency summary
    pub call_latency: LatencySummary,
    /// Job latency summary
    pub job_latency: LatencySummary,
    /// Most-called operations
    pub top_operations: Vec<OperationCount>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty_ring_returns_zero() {
        let ring = DurationRing::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.average(), Duration::ZERO);
        assert_eq!(ring.min(), Duration::ZERO);
        assert_eq!(ring.max(), Duration::ZERO);
        assert_eq!(ring.latest(), Duration::ZERO);
        assert_eq!(ring.percentile(50.0), Duration::ZERO);
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        let ring = DurationRing::new(3);
        for n in 1..=5 {
            ring.add(ms(n * 10));
        }

        // 10 and 20 were overwritten
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.min(), ms(30));
        assert_eq!(ring.max(), ms(50));
        assert_eq!(ring.latest(), ms(50));
        assert_eq!(ring.average(), ms(40));
    }

    #[test]
    fn test_latest_before_full() {
        let ring = DurationRing::new(10);
        ring.add(ms(7));
        ring.add(ms(3));
        assert_eq!(ring.latest(), ms(3));
    }

    #[test]
    fn test_percentile_interpolates() {
        let ring = DurationRing::new(10);
        for n in [40, 10, 30, 20] {
            ring.add(ms(n));
        }

        assert_eq!(ring.percentile(0.0), ms(10));
        assert_eq!(ring.percentile(100.0), ms(40));
        // rank 1.5 between 20 and 30
        let p50 = ring.percentile(50.0).as_secs_f64() * 1000.0;
        assert!((p50 - 25.0).abs() < 0.001);
    }

    #[test]
    fn test_percentile_out_of_range() {
        let ring = DurationRing::new(4);
        ring.add(ms(5));
        assert_eq!(ring.percentile(-1.0), Duration::ZERO);
        assert_eq!(ring.percentile(100.5), Duration::ZERO);
        assert_eq!(ring.percentile(f64::NAN), Duration::ZERO);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let ring = DurationRing::new(0);
        ring.add(ms(1));
        ring.add(ms(2));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.latest(), ms(2));
    }

    #[test]
    fn test_snapshot_ratios() {
        let metrics = Metrics::new();
        metrics.record_call("watched", ms(10), true);
        metrics.record_call("watched", ms(20), false);
        metrics.record_call("ratings", ms(30), true);
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls, 3);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.error_rate - 0.333).abs() < 0.01);
        assert!((snapshot.cache_hit_rate - 0.666).abs() < 0.01);
        assert_eq!(snapshot.top_operations[0].operation, "watched");
        assert_eq!(snapshot.top_operations[0].calls, 2);
        assert_eq!(metrics.operation_calls("ratings"), 1);
        assert_eq!(metrics.operation_calls("unknown"), 0);
    }

    #[test]
    fn test_concurrent_counters_lose_nothing() {
        let metrics = Arc::new(Metrics::new());
        let threads = 8;
        let per_thread = 1000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..per_thread {
                        metrics.record_call("op", Duration::from_micros(1), true);
                        metrics.record_cache_hit();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls, threads * per_thread);
        assert_eq!(snapshot.cache_hits, threads * per_thread);
        assert_eq!(metrics.operation_calls("op"), threads * per_thread);
        assert_eq!(metrics.call_durations().len(), DEFAULT_RING_CAPACITY);
    }

    #[test]
    fn test_operation_names_capped() {
        let metrics = Metrics::new();
        for i in 0..MAX_TRACKED_OPERATIONS + 10 {
            metrics.record_call(&format!("fetch/{i}"), ms(1), true);
        }
        metrics.record_call("fetch/0", ms(1), true);

        assert_eq!(metrics.operations.len(), MAX_TRACKED_OPERATIONS + 1);
        assert_eq!(metrics.operation_calls("fetch/0"), 2);
        assert_eq!(metrics.operation_calls(&format!("fetch/{MAX_TRACKED_OPERATIONS}")), 0);
        assert_eq!(metrics.operation_calls(OVERFLOW_OPERATION), 10);
    }
}
