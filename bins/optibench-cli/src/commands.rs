// CLI commands: thin operator front-end over the job store.

use anyhow::{bail, Context, Result};
use optibench_common::store::{EnqueueRequest, JobStore, RedisJobStore};
use optibench_common::types::{CompletedRun, SubmissionStatus};
use optibench_common::Config;
use std::path::Path;
use uuid::Uuid;

async fn connect() -> Result<RedisJobStore> {
    let config = Config::from_env();
    RedisJobStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to Redis at {}", config.redis_url))
}

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("'{}' is not a valid submission id", id))
}

fn print_run(run: &CompletedRun) {
    println!("submission:        {}", run.id);
    println!("submitter:         {}", run.submitter_name);
    println!("status:            {}", run.status);
    println!("finished at:       {}", run.finished_at);
    println!("total score:       {:.3}", run.total_score);
    match run.latency_reduction_percent {
        Some(pct) => println!("latency reduction: {:.2}%", pct),
        None => println!("latency reduction: N/A"),
    }
    if let Some(message) = &run.error_message {
        println!("error:             {}", message);
    }
    for result in &run.problem_results {
        let verdict = if result.correct {
            format!("{:.3}", result.score)
        } else {
            format!(
                "0.000 (FAIL: {})",
                result.error_detail.as_deref().unwrap_or("incorrect")
            )
        };
        println!(
            "  {}: baseline={:.2}ms optimized={:.2}ms score={}",
            result.problem_id, result.baseline_time_ms, result.optimized_time_ms, verdict
        );
    }
}

/// Enqueue an archive without going through the HTTP API.
pub async fn submit(name: &str, archive: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("submitter name cannot be empty");
    }
    let path = Path::new(archive);
    if !path.exists() {
        bail!("archive not found: {}", archive);
    }

    let store = connect().await?;
    let submission = store
        .enqueue(EnqueueRequest {
            id: None,
            submitter_name: name.trim().to_string(),
            payload_location: path
                .canonicalize()
                .with_context(|| format!("failed to resolve {}", archive))?
                .display()
                .to_string(),
        })
        .await?;

    println!("✓ queued submission {} for '{}'", submission.id, name.trim());
    Ok(())
}

pub async fn status(id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let store = connect().await?;

    if let Some(run) = store.get_run(id).await? {
        print_run(&run);
        return Ok(());
    }

    match store.get_submission(id).await? {
        Some(submission) => {
            println!("submission: {}", submission.id);
            println!("submitter:  {}", submission.submitter_name);
            println!("status:     {}", submission.status);
            println!("queued at:  {}", submission.queued_at);
            if let Some(started) = submission.started_at {
                println!("started at: {}", started);
            }
        }
        None => bail!("unknown submission id: {}", id),
    }
    Ok(())
}

pub async fn leaderboard() -> Result<()> {
    let store = connect().await?;
    let runs = store.list_completed().await?;

    if runs.is_empty() {
        println!("No completed runs yet.");
        return Ok(());
    }

    println!("{:<5} {:<20} {:>12} {:>10}  {}", "rank", "submitter", "latency", "score", "status");
    for (index, run) in runs.iter().enumerate() {
        let latency = match run.latency_reduction_percent {
            Some(pct) => format!("{:.2}%", pct),
            None => "—".to_string(),
        };
        println!(
            "{:<5} {:<20} {:>12} {:>10.3}  {}",
            index + 1,
            run.submitter_name,
            latency,
            run.total_score,
            run.status
        );
    }
    Ok(())
}

pub async fn queue() -> Result<()> {
    let store = connect().await?;
    let counts = store.counts().await?;
    println!("pending: {}", counts.pending);
    println!("running: {}", counts.running);
    Ok(())
}

/// Manual recovery for a submission left RUNNING by a dead worker: status
/// transitions are monotonic, so the payload is re-enqueued as a fresh row
/// instead of flipping the old one back to PENDING.
pub async fn requeue(id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let store = connect().await?;

    let submission = store
        .get_submission(id)
        .await?
        .with_context(|| format!("unknown submission id: {}", id))?;

    if submission.status != SubmissionStatus::Running {
        bail!(
            "submission {} is {}; only stuck RUNNING rows need a requeue",
            id,
            submission.status
        );
    }

    let replacement = store
        .enqueue(EnqueueRequest {
            id: None,
            submitter_name: submission.submitter_name.clone(),
            payload_location: submission.payload_location.clone(),
        })
        .await?;

    println!(
        "✓ requeued payload of {} as new submission {} (old row stays {} for the record)",
        id, replacement.id, submission.status
    );
    Ok(())
}
