//! boxd-export - resilience engine driver
//!
//! Prints the effective configuration or runs a synthetic load through the
//! retry client, response cache, and worker pool.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, ensure};
use clap::Parser;
use rand::RngExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use boxd_export::{
    Error,
    cache::{LruCache, ResponseCache, spawn_cleanup},
    cli::{Cli, Command},
    config::Config,
    failsafe::RetryClient,
    metrics::Metrics,
    pool::{FnJob, Job, WorkerPool},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Config => print_config(&config),
        Command::Simulate {
            jobs,
            failure_rate,
            keys,
            latency_ms,
        } => {
            let options = Simulation {
                jobs,
                failure_rate,
                keys: keys.max(1),
                latency: Duration::from_millis(latency_ms),
            };
            run_simulation(config, options).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn print_config(config: &Config) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(config).context("serializing configuration")?;
    print!("{yaml}");
    Ok(())
}

struct Simulation {
    jobs: usize,
    failure_rate: f64,
    keys: usize,
    latency: Duration,
}

/// Everything one simulated job touches
struct Engine {
    client: RetryClient,
    cache: ResponseCache,
    failure_rate: f64,
    latency: Duration,
}

impl Engine {
    async fn fetch(&self, token: &CancellationToken, key_index: usize) -> boxd_export::Result<()> {
        let params = json!({ "id": key_index });
        let key = ResponseCache::build_key("sim", "item", &params);
        if self.cache.get::<serde_json::Value>(&key).is_some() {
            return Ok(());
        }

        let response = self
            .client
            .execute(token, "fetch_item", || async move {
                tokio::time::sleep(self.latency).await;
                let roll: f64 = rand::rng().random();
                if roll < self.failure_rate {
                    Err(Error::Transient("simulated upstream hiccup".into()))
                } else {
                    Ok(json!({ "id": key_index, "title": format!("item-{key_index}") }))
                }
            })
            .await?;

        self.cache.set(&key, &response)
    }
}

async fn run_simulation(config: Config, options: Simulation) -> anyhow::Result<()> {
    ensure!(
        (0.0..=1.0).contains(&options.failure_rate),
        "failure rate must be within 0.0-1.0, got {}",
        options.failure_rate
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = options.jobs,
        failure_rate = options.failure_rate,
        workers = config.worker_pool.worker_count,
        "Starting simulation"
    );

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, canceling in-flight operations");
                token.cancel();
            }
        });
    }

    let metrics = Arc::new(Metrics::new());
    let cache = ResponseCache::with_cache(
        LruCache::from_config(&config.cache).with_metrics(Arc::clone(&metrics)),
    );
    let cleanup = spawn_cleanup(
        Arc::clone(cache.inner()),
        config.cache.cleanup_interval,
        token.child_token(),
    );

    let engine = Arc::new(Engine {
        client: RetryClient::from_config("remote-api", &config, Some(Arc::clone(&metrics))),
        cache,
        failure_rate: options.failure_rate,
        latency: options.latency,
    });

    let pool = WorkerPool::new(&config.worker_pool).with_metrics(Arc::clone(&metrics));
    pool.start();

    let make_job = |index: usize| -> Box<dyn Job> {
        let engine = Arc::clone(&engine);
        let key_index = index % options.keys;
        let outer = token.clone();
        FnJob::with_id(format!("sim-{index}"), move |pool_token: CancellationToken| async move {
            tokio::select! {
                () = pool_token.cancelled() => Err(Error::Canceled),
                result = engine.fetch(&outer, key_index) => result,
            }
        })
        .boxed()
    };

    let mut backpressure_waits = 0u64;
    for index in 0..options.jobs {
        loop {
            if token.is_cancelled() {
                break;
            }
            match pool.submit(make_job(index)) {
                Ok(()) => break,
                Err(Error::QueueFull { .. }) => {
                    backpressure_waits += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(e).context("submitting simulated job"),
            }
        }
    }

    if token.is_cancelled() {
        pool.stop_now().await;
    } else {
        pool.stop().await;
    }
    token.cancel();
    if let Err(e) = cleanup.await {
        warn!(error = %e, "Cache cleanup task failed");
    }

    let report = json!({
        "backpressure_waits": backpressure_waits,
        "metrics": metrics.snapshot(),
        "retry_client": engine.client.client_stats(),
        "circuit_breaker_status": engine.client.circuit_breaker().status_message(),
        "cache": engine.cache.stats(),
        "pool": pool.stats(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serializing report")?
    );

    info!("Simulation complete");
    Ok(())
}
