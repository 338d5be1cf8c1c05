mod bench;
mod sandbox;
mod scorer;
mod worker;

use bench::BenchmarkSuite;
use optibench_common::store::RedisJobStore;
use optibench_common::Config;
use sandbox::ProcessSandbox;
use scorer::BaselineCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use worker::{worker_loop, WorkerContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Optibench worker booting...");

    let config = Config::from_env();

    // The suite is reference data: loaded once, shared read-only.
    let suite = BenchmarkSuite::load(&config.problems_dir).map_err(|e| {
        error!("Failed to load benchmark suite: {:#}", e);
        error!(
            "Make sure {} contains one directory per problem",
            config.problems_dir.display()
        );
        e
    })?;

    let problem_ids: Vec<&str> = suite.problems.iter().map(|p| p.id.as_str()).collect();
    info!(
        problems = suite.len(),
        timeout_secs = config.per_submission_timeout_secs,
        parallelism = config.parallelism,
        llm_backend = %config.llm_backend,
        "Loaded benchmark suite: {:?}",
        problem_ids
    );

    let store = RedisJobStore::connect(&config.redis_url).await.map_err(|e| {
        error!("Failed to connect to Redis at {}: {}", config.redis_url, e);
        anyhow::anyhow!(e)
    })?;
    info!("Connected to Redis: {}", config.redis_url);

    let ctx = WorkerContext {
        store: Arc::new(store),
        sandbox: Arc::new(ProcessSandbox::new(&config)),
        suite: Arc::new(suite),
        baselines: Arc::new(BaselineCache::new()),
        per_submission_timeout: Duration::from_secs(config.per_submission_timeout_secs),
        poll_interval: Duration::from_millis(config.poll_interval_ms),
    };

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(config.parallelism);
    for worker_id in 0..config.parallelism {
        handles.push(tokio::spawn(worker_loop(
            worker_id,
            ctx.clone(),
            shutdown_rx.clone(),
        )));
    }

    signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    warn!("Received shutdown signal, waiting for in-flight submissions...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("Worker shutdown complete");
    Ok(())
}
