//! Bounded-concurrency job execution
//!
//! A fixed set of worker tasks pulls jobs from one bounded queue. Submission
//! never waits: a full queue is reported as [`Error::QueueFull`] so the caller
//! can shed load. Each job runs under the pool's job timeout, and a panic or
//! error in one job is recorded and does not take its worker down.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::metrics::{DurationRing, LatencySummary, Metrics};
use crate::{Error, Result};

/// A unit of work executed exactly once by one worker
#[async_trait]
pub trait Job: Send {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Run the job
    ///
    /// `token` fires when the pool is shut down with [`WorkerPool::stop_now`].
    async fn execute(self: Box<Self>, token: CancellationToken) -> Result<()>;
}

/// A [`Job`] built from an async closure
pub struct FnJob<F> {
    id: String,
    func: F,
}

impl<F, Fut> FnJob<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    /// Wrap a closure under a generated id
    pub fn new(func: F) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            func,
        }
    }

    /// Wrap a closure under a caller-chosen id
    pub fn with_id(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            func,
        }
    }

    /// Box for submission
    #[must_use]
    pub fn boxed(self) -> Box<dyn Job> {
        Box::new(self)
    }
}

#[async_trait]
impl<F, Fut> Job for FnJob<F>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(self: Box<Self>, token: CancellationToken) -> Result<()> {
        (self.func)(token).await
    }
}

/// How a job finished
enum Outcome {
    Success,
    Failed(Error),
    Panicked(String),
    TimedOut,
}

/// State shared by the pool handle and its workers
struct Shared {
    receiver: tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>,
    token: CancellationToken,
    job_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
    durations: DurationRing,
    submitted: AtomicU64,
    rejected: AtomicU64,
    processed: AtomicU64,
    succeeded: AtomicU64,
    errored: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    discarded: AtomicU64,
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl Shared {
    async fn worker_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Worker started");
        loop {
            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    biased;
                    () = self.token.cancelled() => None,
                    job = receiver.recv() => job,
                }
            };
            let Some(job) = next else { break };
            self.queued.fetch_sub(1, Ordering::Relaxed);
            self.run(worker, job).await;
        }
        debug!(worker, "Worker stopped");
    }

    async fn run(&self, worker: usize, job: Box<dyn Job>) {
        let id = job.id().to_string();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        let started = Instant::now();
        let guarded = AssertUnwindSafe(job.execute(self.token.child_token())).catch_unwind();
        let result = if self.job_timeout.is_zero() {
            Some(guarded.await)
        } else {
            tokio::time::timeout(self.job_timeout, guarded).await.ok()
        };
        let elapsed = started.elapsed();
        self.active.fetch_sub(1, Ordering::SeqCst);

        let outcome = match result {
            Some(Ok(Ok(()))) => Outcome::Success,
            Some(Ok(Err(e))) => Outcome::Failed(e),
            Some(Err(payload)) => Outcome::Panicked(panic_message(payload.as_ref())),
            None => Outcome::TimedOut,
        };

        let success = matches!(outcome, Outcome::Success);
        match outcome {
            Outcome::Success => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(worker, job = %id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
            }
            Outcome::Failed(e) => {
                self.errored.fetch_add(1, Ordering::Relaxed);
                warn!(worker, job = %id, error = %e, "Job failed");
            }
            Outcome::Panicked(message) => {
                self.errored.fetch_add(1, Ordering::Relaxed);
                self.panicked.fetch_add(1, Ordering::Relaxed);
                error!(worker, job = %id, panic = %message, "Job panicked");
            }
            Outcome::TimedOut => {
                self.errored.fetch_add(1, Ordering::Relaxed);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(worker, job = %id, timeout_ms = self.job_timeout.as_millis() as u64, "Job timed out");
            }
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        self.durations.add(elapsed);
        if let Some(metrics) = &self.metrics {
            metrics.record_job(elapsed, success);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fixed-size pool of async workers fed by a bounded queue
pub struct WorkerPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<Box<dyn Job>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    queue_capacity: usize,
    started: AtomicBool,
}

impl WorkerPool {
    /// Create a stopped pool; jobs may be queued before [`Self::start`]
    #[must_use]
    pub fn new(config: &WorkerPoolConfig) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity);

        Self {
            shared: Arc::new(Shared {
                receiver: tokio::sync::Mutex::new(receiver),
                token: CancellationToken::new(),
                job_timeout: config.job_timeout,
                metrics: None,
                durations: DurationRing::default(),
                submitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                errored: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                timed_out: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                queued: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak_active: AtomicUsize::new(0),
            }),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(Vec::new()),
            worker_count: config.worker_count.max(1),
            queue_capacity,
            started: AtomicBool::new(false),
        }
    }

    /// Record job outcomes into shared metrics
    ///
    /// Must be called before [`Self::start`]; later calls are ignored.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.metrics = Some(metrics);
        }
        self
    }

    /// Spawn the worker tasks
    ///
    /// Starting an already started pool does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Worker pool already started");
            return;
        }

        let mut handles = self.handles.lock();
        for worker in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            handles.push(tokio::spawn(shared.worker_loop(worker)));
        }
        info!(
            workers = self.worker_count,
            queue_capacity = self.queue_capacity,
            "Worker pool started"
        );
    }

    /// Queue a job without waiting
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueFull`] when the queue is at capacity and
    /// [`Error::PoolStopped`] after shutdown.
    pub fn submit(&self, job: Box<dyn Job>) -> Result<()> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Error::PoolStopped);
        };

        // Count before sending so a fast worker never decrements below zero
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(job) {
            Ok(()) => {
                self.shared.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.shared.queued.fetch_sub(1, Ordering::Relaxed);
                match e {
                    TrySendError::Full(_) => {
                        self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(capacity = self.queue_capacity, "Job rejected, queue full");
                        Err(Error::QueueFull {
                            capacity: self.queue_capacity,
                        })
                    }
                    TrySendError::Closed(_) => Err(Error::PoolStopped),
                }
            }
        }
    }

    /// Stop accepting jobs, let workers drain the queue, and wait for them
    pub async fn stop(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        info!("Worker pool stopping, draining queue");
        if !self.started.swap(true, Ordering::SeqCst) {
            // Never started: nothing would drain the queue
            self.discard_queued().await;
            return;
        }
        self.join_workers().await;
        info!(
            processed = self.shared.processed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
    }

    /// Stop accepting jobs, cancel running jobs, and drop queued ones
    ///
    /// Running jobs receive cancellation through their token and are awaited
    /// until they return or hit the job timeout.
    pub async fn stop_now(&self) {
        self.sender.lock().take();
        self.started.store(true, Ordering::SeqCst);
        self.shared.token.cancel();
        self.join_workers().await;
        self.discard_queued().await;
        info!(
            discarded = self.shared.discarded.load(Ordering::Relaxed),
            "Worker pool stopped immediately"
        );
    }

    async fn join_workers(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
    }

    async fn discard_queued(&self) {
        let mut receiver = self.shared.receiver.lock().await;
        let mut count = 0u64;
        while let Ok(job) = receiver.try_recv() {
            debug!(job = %job.id(), "Discarding queued job");
            count += 1;
        }
        if count > 0 {
            self.shared.queued.fetch_sub(count as usize, Ordering::Relaxed);
            self.shared.discarded.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Whether the pool still accepts jobs
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        PoolStats {
            workers: self.worker_count,
            queue_capacity: self.queue_capacity,
            submitted: shared.submitted.load(Ordering::Relaxed),
            rejected: shared.rejected.load(Ordering::Relaxed),
            processed: shared.processed.load(Ordering::Relaxed),
            succeeded: shared.succeeded.load(Ordering::Relaxed),
            errored: shared.errored.load(Ordering::Relaxed),
            panicked: shared.panicked.load(Ordering::Relaxed),
            timed_out: shared.timed_out.load(Ordering::Relaxed),
            discarded: shared.discarded.load(Ordering::Relaxed),
            queued: shared.queued.load(Ordering::Relaxed),
            active: shared.active.load(Ordering::SeqCst),
            peak_active: shared.peak_active.load(Ordering::SeqCst),
            job_duration: LatencySummary::from_ring(&shared.durations),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

/// Worker pool statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Worker tasks
    pub workers: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Jobs accepted into the queue
    pub submitted: u64,
    /// Jobs refused because the queue was full
    pub rejected: u64,
    /// Jobs finished, any outcome
    pub processed: u64,
    /// Jobs that returned `Ok`
    pub succeeded: u64,
    /// Jobs that failed, panicked, or timed out
    pub errored: u64,
    /// Jobs that panicked
    pub panicked: u64,
    /// Jobs that exceeded the job timeout
    pub timed_out: u64,
    /// Queued jobs dropped by an immediate stop
    pub discarded: u64,
    /// Jobs waiting in the queue
    pub queued: usize,
    /// Jobs running now
    pub active: usize,
    /// Most jobs ever running at once
    pub peak_active: usize,
    /// Job duration distribution
    pub job_duration: LatencySummary,
}
