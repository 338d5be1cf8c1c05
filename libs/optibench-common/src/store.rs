use crate::types::{AggregateResult, CompletedRun, ProblemResult, Submission, SubmissionStatus};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use uuid::Uuid;

/// Redis key semantics - defines only semantics, not runtime logic.
/// Keeps the API, worker, and CLI views of queue state from drifting.

pub const SUBMISSION_PREFIX: &str = "optibench:submission";
pub const RESULT_PREFIX: &str = "optibench:result";
pub const PENDING_QUEUE: &str = "optibench:pending";
pub const RUNNING_SET: &str = "optibench:running";
pub const COMPLETED_LIST: &str = "optibench:completed";

/// Row key for a submission
pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

/// Row key for a completed run
pub fn result_key(id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, id)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission id {0} already exists")]
    DuplicateId(Uuid),
    #[error("submission {0} not found")]
    NotFound(Uuid),
    #[error("submission {0} is not RUNNING; refusing terminal write")]
    AlreadyTerminal(Uuid),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Enqueue input from the upload boundary. `id` is normally None; an
/// externally-assigned id is honored but collides with `DuplicateId`.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub id: Option<Uuid>,
    pub submitter_name: String,
    pub payload_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub running: usize,
}

/// Durable queue of submissions; the single source of truth for queue state.
///
/// All cross-worker coordination goes through this trait. The claim operation
/// is the one cross-worker invariant: exactly one caller may receive a given
/// pending row.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new PENDING row and return it.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Submission, StoreError>;

    /// Atomically take the oldest PENDING row, transition it to RUNNING and
    /// stamp `started_at`. Returns None when the queue is empty.
    async fn claim_next(&self) -> Result<Option<Submission>, StoreError>;

    /// Write the terminal row for a RUNNING submission. Fails with
    /// `AlreadyTerminal` when the row is not currently RUNNING, which
    /// indicates a coordination bug rather than a recoverable condition.
    async fn complete(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        results: Vec<ProblemResult>,
        aggregate: AggregateResult,
        error_message: Option<String>,
    ) -> Result<CompletedRun, StoreError>;

    /// Completed runs ordered by total score descending, ties broken by
    /// earlier finish time.
    async fn list_completed(&self) -> Result<Vec<CompletedRun>, StoreError>;

    /// Pending/running depths for the reporting boundary.
    async fn counts(&self) -> Result<QueueCounts, StoreError>;

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<CompletedRun>, StoreError>;
}

fn rank_runs(runs: &mut [CompletedRun]) {
    runs.sort_by(|a, b| {
        b.total_score
            .partial_cmp(&a.total_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.finished_at.cmp(&b.finished_at))
    });
}

fn build_run(
    row: &Submission,
    finished_at: chrono::DateTime<Utc>,
    results: Vec<ProblemResult>,
    aggregate: AggregateResult,
    error_message: Option<String>,
) -> CompletedRun {
    CompletedRun {
        id: row.id,
        submitter_name: row.submitter_name.clone(),
        status: row.status,
        finished_at,
        total_score: aggregate.total_score,
        latency_reduction_percent: aggregate.latency_reduction_percent,
        problem_results: results,
        error_message,
    }
}

/// Production backend.
///
/// The pending queue is a Redis list: RPUSH on enqueue, LPOP on claim. The
/// list pop is the single atomic read-modify-write that guarantees exactly
/// one claimer per row; FIFO order falls out of the list. Submission and
/// result rows are JSON values keyed by id and are never deleted.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
}

impl RedisJobStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Submission, StoreError> {
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        let submission = Submission {
            id,
            submitter_name: request.submitter_name,
            payload_location: request.payload_location,
            status: SubmissionStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };

        let payload = serde_json::to_string(&submission)?;
        let mut conn = self.conn.clone();

        // SET NX doubles as duplicate detection for externally-assigned ids.
        let created: bool = conn.set_nx(submission_key(&id), payload).await?;
        if !created {
            return Err(StoreError::DuplicateId(id));
        }

        let _: () = conn.rpush(PENDING_QUEUE, id.to_string()).await?;
        Ok(submission)
    }

    async fn claim_next(&self) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();

        // LPOP is the atomic claim: one caller receives the id, everyone
        // else sees the next row or an empty queue.
        let popped: Option<String> = conn.lpop(PENDING_QUEUE, None).await?;
        let id_str = match popped {
            Some(s) => s,
            None => return Ok(None),
        };
        let id = Uuid::parse_str(&id_str)
            .map_err(|e| StoreError::Backend(format!("malformed queue entry '{}': {}", id_str, e)))?;

        let payload: Option<String> = conn.get(submission_key(&id)).await?;
        let payload = payload
            .ok_or_else(|| StoreError::Backend(format!("queued id {} has no submission row", id)))?;
        let mut submission: Submission = serde_json::from_str(&payload)?;

        if submission.status != SubmissionStatus::Pending {
            return Err(StoreError::Backend(format!(
                "queued submission {} is {} instead of PENDING",
                id, submission.status
            )));
        }

        submission.status = SubmissionStatus::Running;
        submission.started_at = Some(Utc::now());

        let updated = serde_json::to_string(&submission)?;
        let _: () = conn.set(submission_key(&id), updated).await?;
        let _: () = conn.sadd(RUNNING_SET, id.to_string()).await?;

        Ok(Some(submission))
    }

    async fn complete(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        results: Vec<ProblemResult>,
        aggregate: AggregateResult,
        error_message: Option<String>,
    ) -> Result<CompletedRun, StoreError> {
        debug_assert!(status.is_terminal());
        let mut conn = self.conn.clone();

        let payload: Option<String> = conn.get(submission_key(&id)).await?;
        let payload = payload.ok_or(StoreError::NotFound(id))?;
        let mut submission: Submission = serde_json::from_str(&payload)?;

        if submission.status != SubmissionStatus::Running {
            return Err(StoreError::AlreadyTerminal(id));
        }

        let finished_at = Utc::now();
        submission.status = status;
        submission.finished_at = Some(finished_at);

        let run = build_run(&submission, finished_at, results, aggregate, error_message);

        let updated = serde_json::to_string(&submission)?;
        let run_payload = serde_json::to_string(&run)?;
        let _: () = conn.set(submission_key(&id), updated).await?;
        let _: () = conn.set(result_key(&id), run_payload).await?;
        let _: () = conn.rpush(COMPLETED_LIST, id.to_string()).await?;
        let _: () = conn.srem(RUNNING_SET, id.to_string()).await?;

        Ok(run)
    }

    async fn list_completed(&self) -> Result<Vec<CompletedRun>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.lrange(COMPLETED_LIST, 0, -1).await?;

        let mut runs = Vec::with_capacity(ids.len());
        for id_str in ids {
            let id = match Uuid::parse_str(&id_str) {
                Ok(id) => id,
                Err(_) => continue,
            };
            let payload: Option<String> = conn.get(result_key(&id)).await?;
            if let Some(payload) = payload {
                runs.push(serde_json::from_str(&payload)?);
            }
        }

        rank_runs(&mut runs);
        Ok(runs)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let mut conn = self.conn.clone();
        let pending: usize = conn.llen(PENDING_QUEUE).await?;
        let running: usize = conn.scard(RUNNING_SET).await?;
        Ok(QueueCounts { pending, running })
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(submission_key(&id)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CompletedRun>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(result_key(&id)).await?;
        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct MemoryInner {
    rows: HashMap<Uuid, Submission>,
    pending: VecDeque<Uuid>,
    completed: Vec<CompletedRun>,
}

/// Single-process backend for tests and embedded deployments.
///
/// Claim takes the queue head and flips the row under one lock acquisition,
/// so the exactly-one-claimer contract holds across concurrent tasks.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: tokio::sync::Mutex<MemoryInner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<Submission, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        if inner.rows.contains_key(&id) {
            return Err(StoreError::DuplicateId(id));
        }

        let submission = Submission {
            id,
            submitter_name: request.submitter_name,
            payload_location: request.payload_location,
            status: SubmissionStatus::Pending,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        inner.rows.insert(id, submission.clone());
        inner.pending.push_back(id);
        Ok(submission)
    }

    async fn claim_next(&self) -> Result<Option<Submission>, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = match inner.pending.pop_front() {
            Some(id) => id,
            None => return Ok(None),
        };

        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::Backend(format!("queued id {} has no submission row", id)))?;
        row.status = SubmissionStatus::Running;
        row.started_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }

    async fn complete(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        results: Vec<ProblemResult>,
        aggregate: AggregateResult,
        error_message: Option<String>,
    ) -> Result<CompletedRun, StoreError> {
        debug_assert!(status.is_terminal());
        let mut inner = self.inner.lock().await;

        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if row.status != SubmissionStatus::Running {
            return Err(StoreError::AlreadyTerminal(id));
        }
        let finished_at = Utc::now();
        row.status = status;
        row.finished_at = Some(finished_at);

        let run = build_run(row, finished_at, results, aggregate, error_message);
        inner.completed.push(run.clone());
        Ok(run)
    }

    async fn list_completed(&self) -> Result<Vec<CompletedRun>, StoreError> {
        let inner = self.inner.lock().await;
        let mut runs = inner.completed.clone();
        rank_runs(&mut runs);
        Ok(runs)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let inner = self.inner.lock().await;
        let running = inner
            .rows
            .values()
            .filter(|s| s.status == SubmissionStatus::Running)
            .count();
        Ok(QueueCounts {
            pending: inner.pending.len(),
            running,
        })
    }

    async fn get_submission(&self, id: Uuid) -> Result<Option<Submission>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.get(&id).cloned())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<CompletedRun>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.completed.iter().find(|r| r.id == id).cloned())
    }
}
