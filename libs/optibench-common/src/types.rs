use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Submission lifecycle states.
/// Transitions are monotonic: Pending -> Running -> {Success, Error}.
/// A row never returns to Pending once claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubmissionStatus::Success | SubmissionStatus::Error)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionStatus::Pending => write!(f, "PENDING"),
            SubmissionStatus::Running => write!(f, "RUNNING"),
            SubmissionStatus::Success => write!(f, "SUCCESS"),
            SubmissionStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// A queued unit of work: one team's uploaded optimizer archive.
///
/// Created on upload, mutated only by the worker that claims it, never
/// deleted. The timestamps are each set exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub submitter_name: String,
    /// Path of the uploaded archive on shared storage.
    pub payload_location: String,
    pub status: SubmissionStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Outcome of running one submission against one benchmark problem.
/// Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemResult {
    pub problem_id: String,
    pub correct: bool,
    pub baseline_time_ms: f64,
    pub optimized_time_ms: f64,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl ProblemResult {
    /// Score for a correct run: 1.0 plus one point per second of latency
    /// shaved off the baseline. A correct-but-slower run still scores 1.0.
    pub fn score_for(baseline_time_ms: f64, optimized_time_ms: f64) -> f64 {
        1.0 + (baseline_time_ms - optimized_time_ms).max(0.0) / 1000.0
    }

    pub fn passed(
        problem_id: impl Into<String>,
        baseline_time_ms: f64,
        optimized_time_ms: f64,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            correct: true,
            baseline_time_ms,
            optimized_time_ms,
            score: Self::score_for(baseline_time_ms, optimized_time_ms),
            error_detail: None,
        }
    }

    pub fn failed(
        problem_id: impl Into<String>,
        baseline_time_ms: f64,
        optimized_time_ms: f64,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            problem_id: problem_id.into(),
            correct: false,
            baseline_time_ms,
            optimized_time_ms,
            score: 0.0,
            error_detail: Some(error_detail.into()),
        }
    }
}

/// Derived totals, computed once per submission at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub total_score: f64,
    /// Percentage decrease in total runtime vs. baseline over problems that
    /// completed with `correct == true`; None when no problem qualifies.
    pub latency_reduction_percent: Option<f64>,
}

impl AggregateResult {
    pub fn from_results(results: &[ProblemResult]) -> Self {
        let total_score: f64 = results.iter().map(|r| r.score).sum();

        let mut baseline_total = 0.0;
        let mut optimized_total = 0.0;
        for r in results.iter().filter(|r| r.correct) {
            baseline_total += r.baseline_time_ms;
            optimized_total += r.optimized_time_ms;
        }

        let latency_reduction_percent = if baseline_total > 0.0 {
            Some((baseline_total - optimized_total) / baseline_total * 100.0)
        } else {
            None
        };

        Self {
            total_score,
            latency_reduction_percent,
        }
    }
}

/// Terminal row written once per submission, read by the reporting boundary.
///
/// `problem_results` keeps suite order; an empty vec means a structural
/// failure prevented any problem from running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRun {
    pub id: Uuid,
    pub submitter_name: String,
    pub status: SubmissionStatus,
    pub finished_at: DateTime<Utc>,
    pub total_score: f64,
    pub latency_reduction_percent: Option<f64>,
    pub problem_results: Vec<ProblemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}
