// Correctness checking and scoring.
//
// Pure logic on the sandbox's raw outputs:
// - knows nothing about process execution
// - knows nothing about the job store
// - (outcome, expected outputs, baseline time) -> ProblemResult
//
// Keeping this side-effect free guarantees deterministic scoring no matter
// which sandbox implementation produced the outputs.

use crate::bench::{BenchmarkProblem, OutputCheck};
use crate::sandbox::{RunOutcome, Sandbox};
use anyhow::Result;
use optibench_common::types::ProblemResult;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Compare one produced output against the expected output under the
/// problem's policy.
///
/// Exact comparison is byte-for-byte string equality. The tolerance policy
/// compares whitespace-separated tokens: numeric tokens within the declared
/// epsilon, everything else exactly.
pub fn outputs_match(check: OutputCheck, actual: &str, expected: &str) -> bool {
    match check {
        OutputCheck::Exact => actual == expected,
        OutputCheck::FloatTolerance(eps) => {
            let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
            let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
            if actual_tokens.len() != expected_tokens.len() {
                return false;
            }
            actual_tokens
                .iter()
                .zip(&expected_tokens)
                .all(|(a, e)| match (a.parse::<f64>(), e.parse::<f64>()) {
                    (Ok(a), Ok(e)) => (a - e).abs() <= eps,
                    _ => a == e,
                })
        }
    }
}

/// Map a sandbox outcome to the problem's scored result.
///
/// Anything but a completed run with every test case matching scores 0.0
/// and carries a short diagnostic; the submitter never sees raw dumps.
pub fn score_problem(
    problem: &BenchmarkProblem,
    baseline_time_ms: f64,
    outcome: &RunOutcome,
) -> ProblemResult {
    match outcome {
        RunOutcome::Completed { outputs, elapsed_ms } => {
            if outputs.len() != problem.tests.len() {
                return ProblemResult::failed(
                    &problem.id,
                    baseline_time_ms,
                    *elapsed_ms,
                    format!(
                        "produced {} outputs for {} test cases",
                        outputs.len(),
                        problem.tests.len()
                    ),
                );
            }

            let mismatch = outputs
                .iter()
                .zip(&problem.tests)
                .position(|(out, test)| !outputs_match(problem.check, out, &test.expected_output));

            match mismatch {
                None => ProblemResult::passed(&problem.id, baseline_time_ms, *elapsed_ms),
                Some(index) => ProblemResult::failed(
                    &problem.id,
                    baseline_time_ms,
                    *elapsed_ms,
                    format!("wrong output on test case {}", index + 1),
                ),
            }
        }
        RunOutcome::TimedOut { budget_ms } => ProblemResult::failed(
            &problem.id,
            baseline_time_ms,
            0.0,
            format!("timed out after {}ms", budget_ms),
        ),
        RunOutcome::Crashed { detail } => ProblemResult::failed(
            &problem.id,
            baseline_time_ms,
            0.0,
            format!("crashed: {}", detail),
        ),
    }
}

/// Baseline wall-clock times, measured once per problem per process.
///
/// The baseline does not change between submissions, so every submission is
/// compared against the same measurement. The lock is held across the
/// measurement itself: when several workers need the same problem at
/// startup, exactly one measures and the rest reuse it.
#[derive(Default)]
pub struct BaselineCache {
    times: Mutex<HashMap<String, f64>>,
}

impl BaselineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn time_for(&self, problem: &BenchmarkProblem, sandbox: &dyn Sandbox) -> Result<f64> {
        let mut times = self.times.lock().await;
        if let Some(&ms) = times.get(&problem.id) {
            return Ok(ms);
        }
        let ms = sandbox.measure_baseline(problem).await?;
        times.insert(problem.id.clone(), ms);
        Ok(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bench::TestCase;
    use crate::sandbox::{PrepareError, SubmissionWorkspace};
    use async_trait::async_trait;
    use optibench_common::types::Submission;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn problem(check: OutputCheck, expected: &[&str]) -> BenchmarkProblem {
        BenchmarkProblem {
            id: "problem-1".to_string(),
            baseline_path: PathBuf::from("/nonexistent/baseline.py"),
            tests: expected
                .iter()
                .map(|e| TestCase {
                    input: String::new(),
                    expected_output: e.to_string(),
                })
                .collect(),
            check,
        }
    }

    #[test]
    fn test_exact_match_is_strict() {
        assert!(outputs_match(OutputCheck::Exact, "42\n", "42\n"));
        assert!(!outputs_match(OutputCheck::Exact, "42", "42\n"));
        assert!(!outputs_match(OutputCheck::Exact, "Hello", "hello"));
    }

    #[test]
    fn test_float_tolerance_within_epsilon() {
        let check = OutputCheck::FloatTolerance(1e-3);
        assert!(outputs_match(check, "3.1415\n", "3.1412"));
        assert!(!outputs_match(check, "3.15\n", "3.14"));
    }

    #[test]
    fn test_float_tolerance_token_count_must_agree() {
        let check = OutputCheck::FloatTolerance(1e-3);
        assert!(!outputs_match(check, "1.0 2.0", "1.0"));
    }

    #[test]
    fn test_float_tolerance_non_numeric_tokens_compared_exactly() {
        let check = OutputCheck::FloatTolerance(1e-3);
        assert!(outputs_match(check, "sum: 3.0001", "sum: 3.0"));
        assert!(!outputs_match(check, "total: 3.0", "sum: 3.0"));
    }

    #[test]
    fn test_completed_all_matching_scores_formula() {
        let p = problem(OutputCheck::Exact, &["3\n"]);
        let outcome = RunOutcome::Completed {
            outputs: vec!["3\n".to_string()],
            elapsed_ms: 100.0,
        };

        let result = score_problem(&p, 500.0, &outcome);
        assert!(result.correct);
        assert_eq!(result.score, 1.0 + (500.0 - 100.0) / 1000.0);
        assert_eq!(result.optimized_time_ms, 100.0);
        assert!(result.error_detail.is_none());
    }

    #[test]
    fn test_completed_instant_return_on_500ms_baseline() {
        let p = problem(OutputCheck::Exact, &["ok\n"]);
        let outcome = RunOutcome::Completed {
            outputs: vec!["ok\n".to_string()],
            elapsed_ms: 0.0,
        };

        let result = score_problem(&p, 500.0, &outcome);
        assert!(result.correct);
        assert!((result.score - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_completed_with_mismatch_names_the_test_case() {
        let p = problem(OutputCheck::Exact, &["a\n", "b\n"]);
        let outcome = RunOutcome::Completed {
            outputs: vec!["a\n".to_string(), "wrong\n".to_string()],
            elapsed_ms: 50.0,
        };

        let result = score_problem(&p, 500.0, &outcome);
        assert!(!result.correct);
        assert_eq!(result.score, 0.0);
        assert_eq!(
            result.error_detail.as_deref(),
            Some("wrong output on test case 2")
        );
    }

    #[test]
    fn test_short_output_set_fails() {
        let p = problem(OutputCheck::Exact, &["a\n", "b\n"]);
        let outcome = RunOutcome::Completed {
            outputs: vec!["a\n".to_string()],
            elapsed_ms: 50.0,
        };

        let result = score_problem(&p, 500.0, &outcome);
        assert!(!result.correct);
        assert!(result.error_detail.unwrap().contains("1 outputs"));
    }

    #[test]
    fn test_timeout_scores_zero_with_detail() {
        let p = problem(OutputCheck::Exact, &["a\n"]);
        let result = score_problem(&p, 500.0, &RunOutcome::TimedOut { budget_ms: 20_000 });
        assert!(!result.correct);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.error_detail.as_deref(), Some("timed out after 20000ms"));
    }

    #[test]
    fn test_crash_scores_zero_with_detail() {
        let p = problem(OutputCheck::Exact, &["a\n"]);
        let outcome = RunOutcome::Crashed {
            detail: "optimizer exited with code Some(1)".to_string(),
        };
        let result = score_problem(&p, 500.0, &outcome);
        assert!(!result.correct);
        assert!(result.error_detail.unwrap().starts_with("crashed:"));
    }

    struct CountingSandbox {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Sandbox for CountingSandbox {
        async fn prepare(
            &self,
            _submission: &Submission,
        ) -> Result<SubmissionWorkspace, PrepareError> {
            Err(PrepareError::Internal {
                detail: "not used".to_string(),
            })
        }

        async fn run_problem(
            &self,
            _workspace: &SubmissionWorkspace,
            _problem: &BenchmarkProblem,
            _budget: Duration,
        ) -> RunOutcome {
            RunOutcome::Crashed {
                detail: "not used".to_string(),
            }
        }

        async fn measure_baseline(&self, _problem: &BenchmarkProblem) -> Result<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(123.0)
        }
    }

    #[tokio::test]
    async fn test_baseline_measured_once_per_problem() {
        let sandbox = CountingSandbox {
            calls: AtomicUsize::new(0),
        };
        let cache = BaselineCache::new();
        let p = problem(OutputCheck::Exact, &["x\n"]);

        assert_eq!(cache.time_for(&p, &sandbox).await.unwrap(), 123.0);
        assert_eq!(cache.time_for(&p, &sandbox).await.unwrap(), 123.0);
        assert_eq!(sandbox.calls.load(Ordering::SeqCst), 1);
    }
}
