//! Worker pool integration tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};

use boxd_export::Error;
use boxd_export::config::WorkerPoolConfig;
use boxd_export::metrics::Metrics;
use boxd_export::pool::{FnJob, WorkerPool};

fn pool_config(worker_count: usize, queue_capacity: usize) -> WorkerPoolConfig {
    WorkerPoolConfig {
        worker_count,
        queue_capacity,
        job_timeout: Duration::from_secs(5),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_throughput_respects_worker_limit() {
    const WORKERS: usize = 4;
    const JOBS: usize = 40;

    let pool = WorkerPool::new(&pool_config(WORKERS, JOBS));
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    for i in 0..JOBS {
        let running = Arc::clone(&running);
        let max_running = Arc::clone(&max_running);
        let done = Arc::clone(&done);
        pool.submit(
            FnJob::with_id(format!("export-{i}"), move |_| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .boxed(),
        )
        .unwrap();
    }

    pool.start();
    pool.stop().await;

    assert_eq!(done.load(Ordering::SeqCst), JOBS);
    assert!(max_running.load(Ordering::SeqCst) <= WORKERS);

    let stats = pool.stats();
    assert_eq!(stats.processed, JOBS as u64);
    assert!(stats.peak_active <= WORKERS);
    assert!(stats.peak_active >= 1);
    assert_eq!(stats.job_duration.samples, JOBS);
}

#[tokio::test]
async fn test_backpressure_when_workers_busy() {
    let pool = WorkerPool::new(&pool_config(1, 2));
    pool.start();

    let release = Arc::new(Notify::new());
    let (started_tx, started_rx) = oneshot::channel();
    {
        let release = Arc::clone(&release);
        pool.submit(
            FnJob::new(move |_| async move {
                let _ = started_tx.send(());
                release.notified().await;
                Ok(())
            })
            .boxed(),
        )
        .unwrap();
    }
    started_rx.await.unwrap();

    // The only worker is busy; two jobs fill the queue
    for _ in 0..2 {
        pool.submit(FnJob::new(|_| async { Ok(()) }).boxed()).unwrap();
    }
    let rejected = pool.submit(FnJob::new(|_| async { Ok(()) }).boxed());
    assert!(matches!(rejected, Err(Error::QueueFull { capacity: 2 })));
    assert_eq!(pool.stats().queued, 2);
    assert_eq!(pool.stats().active, 1);

    release.notify_one();
    pool.stop().await;

    let stats = pool.stats();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.rejected, 1);
}

#[tokio::test]
async fn test_failures_do_not_stop_workers() {
    let metrics = Arc::new(Metrics::new());
    let pool = WorkerPool::new(&WorkerPoolConfig {
        worker_count: 2,
        queue_capacity: 16,
        job_timeout: Duration::from_millis(50),
    })
    .with_metrics(Arc::clone(&metrics));
    pool.start();

    pool.submit(
        FnJob::with_id("panics", |_| async {
            let rows: Vec<u32> = Vec::new();
            let _ = rows.first().copied().expect("no rows to export");
            Ok(())
        })
        .boxed(),
    )
    .unwrap();
    pool.submit(
        FnJob::with_id("fails", |_| async { Err(Error::Permanent("malformed csv".into())) }).boxed(),
    )
    .unwrap();
    pool.submit(
        FnJob::with_id("hangs", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .boxed(),
    )
    .unwrap();
    for _ in 0..5 {
        pool.submit(FnJob::new(|_| async { Ok(()) }).boxed()).unwrap();
    }
    pool.stop().await;

    let stats = pool.stats();
    assert_eq!(stats.processed, 8);
    assert_eq!(stats.succeeded, 5);
    assert_eq!(stats.errored, 3);
    assert_eq!(stats.panicked, 1);
    assert_eq!(stats.timed_out, 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.jobs_processed, 8);
    assert_eq!(snapshot.jobs_errored, 3);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_jobs() {
    let pool = WorkerPool::new(&pool_config(2, 8));
    pool.start();
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let finished = Arc::clone(&finished);
        pool.submit(
            FnJob::new(move |_| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .boxed(),
        )
        .unwrap();
    }
    pool.stop().await;

    assert_eq!(finished.load(Ordering::SeqCst), 4);
    assert!(matches!(
        pool.submit(FnJob::new(|_| async { Ok(()) }).boxed()),
        Err(Error::PoolStopped)
    ));
}
