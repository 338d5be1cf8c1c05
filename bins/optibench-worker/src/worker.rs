// Worker state machine: Idle -> Executing -> Finalizing -> Idle.
//
// N of these loops run as independent tokio tasks. They share nothing
// mutable beyond the job store handle and the baseline cache; all
// cross-worker coordination happens through the store's atomic claim.

use crate::bench::BenchmarkSuite;
use crate::sandbox::Sandbox;
use crate::scorer::{score_problem, BaselineCache};
use optibench_common::store::{JobStore, StoreError};
use optibench_common::types::{AggregateResult, ProblemResult, Submission, SubmissionStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub sandbox: Arc<dyn Sandbox>,
    pub suite: Arc<BenchmarkSuite>,
    pub baselines: Arc<BaselineCache>,
    /// Hard budget for one submission's full benchmark run.
    pub per_submission_timeout: Duration,
    pub poll_interval: Duration,
}

/// The per-submission budget is subdivided evenly across the suite.
fn per_problem_budget(total: Duration, problem_count: usize) -> Duration {
    total / problem_count.max(1) as u32
}

async fn idle_wait(interval: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(interval) => {}
        _ = shutdown.changed() => {}
    }
}

/// Claim/execute/finalize until shutdown. A single submission's failure
/// never ends the loop; store errors are retried on the next poll cycle.
pub async fn worker_loop(
    worker_id: usize,
    ctx: WorkerContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match ctx.store.claim_next().await {
            Ok(Some(submission)) => {
                info!(
                    worker_id,
                    submission_id = %submission.id,
                    submitter = %submission.submitter_name,
                    "claimed submission"
                );
                process_submission(&ctx, &submission).await;
            }
            Ok(None) => {
                idle_wait(ctx.poll_interval, &mut shutdown).await;
            }
            Err(e) => {
                error!(worker_id, error = %e, "job store error while claiming");
                idle_wait(Duration::from_secs(1), &mut shutdown).await;
            }
        }
    }
    info!(worker_id, "worker stopped");
}

/// Drive one claimed submission through the pipeline and persist the
/// terminal row.
async fn process_submission(ctx: &WorkerContext, submission: &Submission) {
    let started = Instant::now();
    let (status, results, error_message) = evaluate_submission(ctx, submission).await;
    let aggregate = AggregateResult::from_results(&results);

    info!(
        submission_id = %submission.id,
        status = %status,
        total_score = aggregate.total_score,
        problems = results.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "submission evaluated"
    );

    match ctx
        .store
        .complete(submission.id, status, results, aggregate, error_message)
        .await
    {
        Ok(_) => {
            info!(submission_id = %submission.id, "result persisted");
        }
        Err(StoreError::AlreadyTerminal(id)) => {
            // Someone else wrote a terminal row for our claim: the mutual
            // exclusion invariant was violated upstream.
            error!(submission_id = %id, "coordination bug: row no longer RUNNING at completion");
        }
        Err(e) => {
            // Non-fatal: the worker returns to idle either way.
            error!(submission_id = %submission.id, error = %e, "failed to persist result");
        }
    }
}

/// Execute the full benchmark suite for one submission.
///
/// Structural failures (bad archive, missing entry point, setup failure)
/// yield ERROR with no problem results. Otherwise every problem runs in its
/// own directory with its own slice of the budget, and a failure on one
/// never aborts the rest.
async fn evaluate_submission(
    ctx: &WorkerContext,
    submission: &Submission,
) -> (SubmissionStatus, Vec<ProblemResult>, Option<String>) {
    let workspace = match ctx.sandbox.prepare(submission).await {
        Ok(workspace) => workspace,
        Err(e) => {
            warn!(
                submission_id = %submission.id,
                error = %e,
                "structural failure; no problems will run"
            );
            return (SubmissionStatus::Error, Vec::new(), Some(e.to_string()));
        }
    };

    let budget = per_problem_budget(ctx.per_submission_timeout, ctx.suite.len());
    let mut results = Vec::with_capacity(ctx.suite.len());

    for problem in &ctx.suite.problems {
        let baseline_ms = match ctx.baselines.time_for(problem, ctx.sandbox.as_ref()).await {
            Ok(ms) => ms,
            Err(e) => {
                // Trusted-side failure; recorded against the problem so the
                // rest of the suite still runs.
                error!(problem = %problem.id, error = %e, "baseline measurement failed");
                results.push(ProblemResult::failed(
                    &problem.id,
                    0.0,
                    0.0,
                    "baseline measurement failed",
                ));
                continue;
            }
        };

        let outcome = ctx.sandbox.run_problem(&workspace, problem, budget).await;
        let result = score_problem(problem, baseline_ms, &outcome);

        if result.correct {
            info!(
                submission_id = %submission.id,
                problem = %problem.id,
                score = result.score,
                optimized_ms = result.optimized_time_ms,
                "problem passed"
            );
        } else {
            warn!(
                submission_id = %submission.id,
                problem = %problem.id,
                detail = result.error_detail.as_deref().unwrap_or(""),
                "problem scored zero"
            );
        }
        results.push(result);
    }

    (SubmissionStatus::Success, results, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::{BenchmarkProblem, OutputCheck, TestCase};
    use crate::sandbox::{PrepareError, RunOutcome, SubmissionWorkspace};
    use anyhow::Result;
    use async_trait::async_trait;
    use optibench_common::store::{EnqueueRequest, MemoryJobStore};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use uuid::Uuid;

    /// Scripted sandbox: every problem completes correctly in 100ms against
    /// a 600ms baseline, except the configured crash/missing-entry cases.
    struct ScriptedSandbox {
        crash_on: Option<String>,
        missing_entry: bool,
    }

    impl ScriptedSandbox {
        fn all_passing() -> Self {
            Self {
                crash_on: None,
                missing_entry: false,
            }
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn prepare(
            &self,
            _submission: &Submission,
        ) -> Result<SubmissionWorkspace, PrepareError> {
            if self.missing_entry {
                return Err(PrepareError::MissingEntrypoint {
                    entry: "optimize.py".to_string(),
                });
            }
            let root = tempfile::tempdir().unwrap().into_path();
            let entry = root.join("optimize.py");
            Ok(SubmissionWorkspace::new(root, entry))
        }

        async fn run_problem(
            &self,
            _workspace: &SubmissionWorkspace,
            problem: &BenchmarkProblem,
            _budget: Duration,
        ) -> RunOutcome {
            if self.crash_on.as_deref() == Some(problem.id.as_str()) {
                return RunOutcome::Crashed {
                    detail: "optimizer exited with code Some(1)".to_string(),
                };
            }
            RunOutcome::Completed {
                outputs: problem
                    .tests
                    .iter()
                    .map(|t| t.expected_output.clone())
                    .collect(),
                elapsed_ms: 100.0,
            }
        }

        async fn measure_baseline(&self, _problem: &BenchmarkProblem) -> Result<f64> {
            Ok(600.0)
        }
    }

    fn suite_of(count: usize) -> BenchmarkSuite {
        BenchmarkSuite {
            problems: (1..=count)
                .map(|i| BenchmarkProblem {
                    id: format!("problem-{}", i),
                    baseline_path: PathBuf::from("/nonexistent/baseline.py"),
                    tests: vec![TestCase {
                        input: "in\n".to_string(),
                        expected_output: "out\n".to_string(),
                    }],
                    check: OutputCheck::Exact,
                })
                .collect(),
        }
    }

    fn context(store: Arc<MemoryJobStore>, sandbox: ScriptedSandbox, problems: usize) -> WorkerContext {
        WorkerContext {
            store,
            sandbox: Arc::new(sandbox),
            suite: Arc::new(suite_of(problems)),
            baselines: Arc::new(BaselineCache::new()),
            per_submission_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn enqueue(store: &MemoryJobStore, name: &str) -> Uuid {
        store
            .enqueue(EnqueueRequest {
                id: None,
                submitter_name: name.to_string(),
                payload_location: format!("/data/submissions/{}.zip", name),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_partial_failure_still_succeeds() {
        let store = Arc::new(MemoryJobStore::new());
        let ctx = context(
            Arc::clone(&store),
            ScriptedSandbox {
                crash_on: Some("problem-2".to_string()),
                missing_entry: false,
            },
            3,
        );

        let id = enqueue(&store, "team").await;
        let submission = store.claim_next().await.unwrap().unwrap();
        process_submission(&ctx, &submission).await;

        let run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, SubmissionStatus::Success);
        assert_eq!(run.problem_results.len(), 3);

        let crashed = &run.problem_results[1];
        assert_eq!(crashed.problem_id, "problem-2");
        assert_eq!(crashed.score, 0.0);
        assert!(crashed.error_detail.as_deref().unwrap().starts_with("crashed:"));

        // Two passing problems at 1.0 + (600 - 100)/1000 each.
        assert!((run.total_score - 3.0).abs() < 1e-9);
        assert_eq!(run.latency_reduction_percent, Some((1200.0 - 200.0) / 1200.0 * 100.0));
    }

    #[tokio::test]
    async fn test_missing_entry_point_is_terminal_error() {
        let store = Arc::new(MemoryJobStore::new());
        let ctx = context(
            Arc::clone(&store),
            ScriptedSandbox {
                crash_on: None,
                missing_entry: true,
            },
            3,
        );

        let id = enqueue(&store, "team").await;
        let submission = store.claim_next().await.unwrap().unwrap();
        process_submission(&ctx, &submission).await;

        let run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, SubmissionStatus::Error);
        assert!(run.problem_results.is_empty());
        assert_eq!(run.total_score, 0.0);
        assert_eq!(run.error_message.as_deref(), Some("missing optimize.py"));
        assert_eq!(run.latency_reduction_percent, None);
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue_to_unique_terminal_states() {
        let store = Arc::new(MemoryJobStore::new());
        let ctx = context(Arc::clone(&store), ScriptedSandbox::all_passing(), 2);

        let mut expected = HashSet::new();
        for i in 0..8 {
            expected.insert(enqueue(&store, &format!("team-{}", i)).await);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();
        for worker_id in 0..4 {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                ctx.clone(),
                shutdown_rx.clone(),
            )));
        }

        // Wait for the pool to drain, bounded so a stuck worker fails the
        // test instead of hanging it.
        for _ in 0..500 {
            let counts = store.counts().await.unwrap();
            if counts.pending == 0 && counts.running == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        let runs = store.list_completed().await.unwrap();
        assert_eq!(runs.len(), 8, "every job reaches exactly one terminal state");

        let ids: HashSet<Uuid> = runs.iter().map(|r| r.id).collect();
        assert_eq!(ids, expected, "no job completed twice, none dropped");
        assert!(runs.iter().all(|r| r.status == SubmissionStatus::Success));
    }

    #[test]
    fn test_per_problem_budget_subdivides_evenly() {
        assert_eq!(
            per_problem_budget(Duration::from_secs(180), 9),
            Duration::from_secs(20)
        );
        // Degenerate suite still yields a usable budget.
        assert_eq!(
            per_problem_budget(Duration::from_secs(180), 0),
            Duration::from_secs(180)
        );
    }
}
