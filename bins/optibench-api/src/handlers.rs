// HTTP route handlers for the Optibench API

use axum::{
    extract::{Multipart, Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use optibench_common::store::{EnqueueRequest, JobStore, QueueCounts};
use optibench_common::types::CompletedRun;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submission_id: String,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub pending: usize,
    pub running: usize,
    /// Ordered by total score descending, ties broken by earlier finish.
    pub runs: Vec<CompletedRun>,
}

fn error_reply(code: StatusCode, message: &str) -> Response {
    (code, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Entry names inside the uploaded archive. The entry point must sit at the
/// archive root or under a single top-level folder (the worker flattens the
/// latter on extraction).
fn archive_contains_entry(names: &[String], entry: &str) -> bool {
    let nested_suffix = format!("/{}", entry);
    names.iter().any(|name| {
        name == entry || (name.ends_with(&nested_suffix) && name.matches('/').count() == 1)
    })
}

/// List archive member names with a supervised `unzip -Z1`.
async fn list_archive(path: &Path) -> Result<Vec<String>, String> {
    let output = Command::new("unzip")
        .arg("-Z1")
        .arg(path)
        .output()
        .await
        .map_err(|e| format!("failed to run unzip: {}", e))?;

    if !output.status.success() {
        return Err("invalid archive".to_string());
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

/// POST /submit - accept a submission archive and enqueue it
///
/// Multipart form: `name` (submitter label) and `file` (.zip archive). The
/// archive is stored under a unique name keyed by the new submission id,
/// structurally validated, then enqueued as PENDING.
pub async fn submit(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut name: Option<String> = None;
    let mut file: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    &format!("malformed multipart request: {}", e),
                );
            }
        };

        let field_name = field.name().map(|s| s.to_string());
        match field_name.as_deref() {
            Some("name") => match field.text().await {
                Ok(value) => name = Some(value.trim().to_string()),
                Err(e) => {
                    return error_reply(
                        StatusCode::BAD_REQUEST,
                        &format!("unreadable name field: {}", e),
                    );
                }
            },
            Some("file") => {
                let filename = field.file_name().unwrap_or("submission.zip").to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, bytes.to_vec())),
                    Err(e) => {
                        return error_reply(
                            StatusCode::BAD_REQUEST,
                            &format!("unreadable file field: {}", e),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return error_reply(StatusCode::BAD_REQUEST, "name is required"),
    };
    let (filename, bytes) = match file {
        Some(file) => file,
        None => return error_reply(StatusCode::BAD_REQUEST, "no file part"),
    };

    if !filename.to_lowercase().ends_with(".zip") {
        return error_reply(StatusCode::BAD_REQUEST, "invalid file type; only .zip allowed");
    }

    info!(submitter = %name, file = %filename, size = bytes.len(), "received submission");

    // Unique payload name keyed by the id the row will get; only the final
    // path component of the client-supplied filename is used.
    let filename = Path::new(&filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("submission.zip")
        .to_string();
    let id = Uuid::new_v4();
    let payload_path = state.config.submissions_dir.join(format!("{}_{}", id, filename));

    if let Err(e) = tokio::fs::create_dir_all(&state.config.submissions_dir).await {
        error!(error = %e, "failed to create submissions directory");
        return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable");
    }
    if let Err(e) = tokio::fs::write(&payload_path, &bytes).await {
        error!(error = %e, "failed to store payload");
        return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "storage unavailable");
    }

    // Structural validation before the row exists: the archive root (or its
    // single top-level folder) must contain the optimizer entry point.
    match list_archive(&payload_path).await {
        Ok(names) => {
            if !archive_contains_entry(&names, &state.config.optimizer_entry) {
                warn!(submitter = %name, "archive does not contain the entry point");
                return error_reply(
                    StatusCode::BAD_REQUEST,
                    &format!(
                        "archive must contain {} at its root",
                        state.config.optimizer_entry
                    ),
                );
            }
        }
        Err(detail) => {
            warn!(submitter = %name, detail = %detail, "archive validation failed");
            return error_reply(StatusCode::BAD_REQUEST, &detail);
        }
    }

    let request = EnqueueRequest {
        id: Some(id),
        submitter_name: name.clone(),
        payload_location: payload_path.display().to_string(),
    };

    match state.store.enqueue(request).await {
        Ok(submission) => {
            info!(
                submission_id = %submission.id,
                submitter = %name,
                payload = %submission.payload_location,
                "submission queued"
            );
            (
                StatusCode::CREATED,
                Json(SubmitResponse {
                    submission_id: submission.id.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(submitter = %name, error = %e, "failed to enqueue submission");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "failed to enqueue submission")
        }
    }
}

/// GET /leaderboard - ranked completed runs plus queue depths
pub async fn leaderboard(State(state): State<Arc<AppState>>) -> Response {
    let runs = match state.store.list_completed().await {
        Ok(runs) => runs,
        Err(e) => {
            error!(error = %e, "failed to list completed runs");
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable");
        }
    };
    let QueueCounts { pending, running } = match state.store.counts().await {
        Ok(counts) => counts,
        Err(e) => {
            error!(error = %e, "failed to read queue counts");
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable");
        }
    };

    Json(LeaderboardResponse {
        pending,
        running,
        runs,
    })
    .into_response()
}

/// GET /runs/{id} - one submission's result, or its live status
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => return error_reply(StatusCode::BAD_REQUEST, "invalid submission id"),
    };

    match state.store.get_run(id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(run)).into_response(),
        Ok(None) => match state.store.get_submission(id).await {
            Ok(Some(submission)) => (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "submission_id": id.to_string(),
                    "status": submission.status,
                    "queued_at": submission.queued_at,
                })),
            )
                .into_response(),
            Ok(None) => error_reply(StatusCode::NOT_FOUND, "unknown submission id"),
            Err(e) => {
                error!(submission_id = %id, error = %e, "failed to read submission row");
                error_reply(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
            }
        },
        Err(e) => {
            error!(submission_id = %id, error = %e, "failed to read run row");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        }
    }
}

/// GET /status - health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
