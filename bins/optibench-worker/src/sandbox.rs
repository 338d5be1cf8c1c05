// Sandboxed execution of submitted optimizers.
//
// Architectural boundary (mirrors the scorer split):
// - The sandbox knows HOW to run untrusted code: private working
//   directories, wall-clock deadlines, process-group kill.
// - The sandbox does NOT know scoring rules; it returns raw outputs for
//   the scorer to judge.
//
// Isolation here is process-level only: a fresh working directory per
// problem run plus a hard deadline. Nothing from a submitted program is
// allowed to surface as anything other than a captured exit code, stderr
// tail, or timeout flag.

use crate::bench::BenchmarkProblem;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use optibench_common::config::Config;
use optibench_common::types::Submission;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Name of the artifact the optimizer must produce in its working directory.
pub const OPTIMIZED_ARTIFACT: &str = "optimized.py";
/// Name under which the problem's baseline program is staged.
pub const BASELINE_COPY: &str = "baseline.py";

/// Structural failures detected before any benchmark problem runs.
/// These terminate the whole submission with status ERROR.
#[derive(Debug, Clone)]
pub enum PrepareError {
    /// The archive does not contain the optimizer entry point. Detected
    /// before any process is spawned.
    MissingEntrypoint { entry: String },
    /// Archive extraction or dependency installation failed or overran its
    /// own budget.
    SetupFailed { detail: String },
    /// Worker-side failure (scratch directory unavailable, etc.).
    Internal { detail: String },
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::MissingEntrypoint { entry } => write!(f, "missing {}", entry),
            PrepareError::SetupFailed { detail } => write!(f, "setup failed: {}", detail),
            PrepareError::Internal { detail } => write!(f, "internal error: {}", detail),
        }
    }
}

/// Outcome of one submission/problem pairing.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Optimizer ran to completion and the produced program executed every
    /// test case; `outputs` holds one captured stdout per test case, in
    /// test order. `elapsed_ms` is the summed wall-clock time of the test
    /// executions only.
    Completed { outputs: Vec<String>, elapsed_ms: f64 },
    /// A process exited non-zero or produced no artifact.
    Crashed { detail: String },
    /// The per-problem deadline fired; the process group was SIGKILLed.
    TimedOut { budget_ms: u64 },
}

/// A submission-private directory tree, one subdirectory per problem run.
///
/// Removed on drop unless a failure marked it preserved for post-hoc
/// inspection.
#[derive(Debug)]
pub struct SubmissionWorkspace {
    root: PathBuf,
    entry: PathBuf,
    preserve: AtomicBool,
}

impl SubmissionWorkspace {
    pub fn new(root: PathBuf, entry: PathBuf) -> Self {
        Self {
            root,
            entry,
            preserve: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn mark_preserved(&self) {
        self.preserve.store(true, Ordering::Relaxed);
    }

    pub fn is_preserved(&self) -> bool {
        self.preserve.load(Ordering::Relaxed)
    }
}

impl Drop for SubmissionWorkspace {
    fn drop(&mut self) {
        if self.is_preserved() {
            debug!(path = %self.root.display(), "preserving sandbox directory for inspection");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            warn!(path = %self.root.display(), error = %e, "failed to remove sandbox directory");
        }
    }
}

/// Execution seam between the worker and the operating system, so the
/// pipeline is testable with a scripted fake.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Submission-level setup: extract the payload, verify the entry point,
    /// install declared dependencies. Time-boxed independently of the
    /// per-problem budget.
    async fn prepare(&self, submission: &Submission) -> Result<SubmissionWorkspace, PrepareError>;

    /// Run the submission's optimizer against one problem inside a fresh
    /// problem-private directory, then execute the produced program over the
    /// problem's test cases. Must return by `budget` at the latest.
    async fn run_problem(
        &self,
        workspace: &SubmissionWorkspace,
        problem: &BenchmarkProblem,
        budget: Duration,
    ) -> RunOutcome;

    /// Wall-clock milliseconds for the baseline program over the problem's
    /// test cases.
    async fn measure_baseline(&self, problem: &BenchmarkProblem) -> Result<f64>;
}

/// Raw result of supervising one child process.
#[derive(Debug)]
struct ExecResult {
    stdout: String,
    stderr: String,
    exit_ok: bool,
    exit_code: Option<i32>,
    timed_out: bool,
    elapsed_ms: f64,
}

/// Last few lines of a diagnostic stream; full dumps never reach the
/// submitter.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Production sandbox: tokio child processes in their own process groups.
pub struct ProcessSandbox {
    python_bin: String,
    optimizer_entry: String,
    llm_backend: String,
    scratch_dir: PathBuf,
    setup_timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(config: &Config) -> Self {
        Self {
            python_bin: config.python_bin.clone(),
            optimizer_entry: config.optimizer_entry.clone(),
            llm_backend: config.llm_backend.clone(),
            scratch_dir: config.scratch_dir.clone(),
            setup_timeout: Duration::from_secs(config.setup_timeout_secs),
        }
    }

    /// Supervise one child to completion or deadline. On expiry the child's
    /// whole process group is SIGKILLed; submitted code gets no chance to
    /// ignore the cancellation.
    async fn exec(
        &self,
        cmd: &mut Command,
        stdin_data: Option<&str>,
        deadline: Duration,
    ) -> Result<ExecResult> {
        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().context("failed to spawn sandbox process")?;

        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let mut stdin_pipe = child.stdin.take();

        let supervised = async move {
            if let (Some(mut pipe), Some(data)) = (stdin_pipe.take(), stdin_data) {
                // Ignore broken pipes: the child may exit without reading.
                let _ = pipe.write_all(data.as_bytes()).await;
                let _ = pipe.shutdown().await;
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(deadline, supervised).await {
            Ok(output) => {
                let output = output.context("failed waiting for sandbox process")?;
                Ok(ExecResult {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_ok: output.status.success(),
                    exit_code: output.status.code(),
                    timed_out: false,
                    elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                })
            }
            Err(_) => {
                // Deadline fired. The whole group dies, not just the direct
                // child; kill_on_drop reaps whatever remains of the child.
                if let Some(pgid) = pgid {
                    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                        warn!(error = %e, "failed to kill sandbox process group");
                    }
                }
                Ok(ExecResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_ok: false,
                    exit_code: None,
                    timed_out: true,
                    elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                })
            }
        }
    }

    /// Stage the payload into `dest`. Directory payloads are copied as-is
    /// (local/test submissions); anything else is treated as a zip archive
    /// and extracted with a supervised `unzip`.
    async fn stage_payload(&self, payload: &Path, dest: &Path) -> Result<(), PrepareError> {
        if payload.is_dir() {
            copy_tree(payload, dest).map_err(|e| PrepareError::Internal {
                detail: format!("failed to copy payload: {}", e),
            })?;
            return Ok(());
        }

        let mut cmd = Command::new("unzip");
        cmd.arg("-o").arg("-q").arg(payload).arg("-d").arg(dest);
        let result = self
            .exec(&mut cmd, None, self.setup_timeout)
            .await
            .map_err(|e| PrepareError::Internal {
                detail: format!("failed to run unzip: {}", e),
            })?;

        if result.timed_out {
            return Err(PrepareError::SetupFailed {
                detail: "archive extraction timed out".to_string(),
            });
        }
        if !result.exit_ok {
            return Err(PrepareError::SetupFailed {
                detail: format!("invalid archive: {}", tail(&result.stderr, 3)),
            });
        }
        Ok(())
    }

    async fn install_requirements(&self, agent_dir: &Path) -> Result<(), PrepareError> {
        let requirements = agent_dir.join("requirements.txt");
        if !requirements.exists() {
            return Ok(());
        }

        debug!(path = %requirements.display(), "installing submission requirements");
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg("-m")
            .arg("pip")
            .arg("install")
            .arg("--user")
            .arg("-r")
            .arg(&requirements)
            .current_dir(agent_dir);

        let result = self
            .exec(&mut cmd, None, self.setup_timeout)
            .await
            .map_err(|e| PrepareError::Internal {
                detail: format!("failed to run pip: {}", e),
            })?;

        if result.timed_out {
            return Err(PrepareError::SetupFailed {
                detail: "dependency installation timed out".to_string(),
            });
        }
        if !result.exit_ok {
            return Err(PrepareError::SetupFailed {
                detail: format!(
                    "pip install failed, rc {:?}; tail of stderr: {}",
                    result.exit_code,
                    tail(&result.stderr, 5)
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn prepare(&self, submission: &Submission) -> Result<SubmissionWorkspace, PrepareError> {
        fs::create_dir_all(&self.scratch_dir).map_err(|e| PrepareError::Internal {
            detail: format!("scratch directory unavailable: {}", e),
        })?;

        let root = self.scratch_dir.join(format!("submission-{}", submission.id));
        let agent_dir = root.join("agent");
        fs::create_dir_all(&agent_dir).map_err(|e| PrepareError::Internal {
            detail: format!("failed to create workspace: {}", e),
        })?;

        let payload = PathBuf::from(&submission.payload_location);
        if !payload.exists() {
            return Err(PrepareError::SetupFailed {
                detail: "payload not found on disk".to_string(),
            });
        }

        self.stage_payload(&payload, &agent_dir).await?;

        flatten_nested_dir(&agent_dir).map_err(|e| PrepareError::Internal {
            detail: format!("failed to flatten archive layout: {}", e),
        })?;

        let entry = agent_dir.join(&self.optimizer_entry);
        if !entry.exists() {
            // The failed workspace stays on disk for inspection.
            return Err(PrepareError::MissingEntrypoint {
                entry: self.optimizer_entry.clone(),
            });
        }

        self.install_requirements(&agent_dir).await?;

        Ok(SubmissionWorkspace::new(root, entry))
    }

    async fn run_problem(
        &self,
        workspace: &SubmissionWorkspace,
        problem: &BenchmarkProblem,
        budget: Duration,
    ) -> RunOutcome {
        let deadline = Instant::now() + budget;
        let budget_ms = budget.as_millis() as u64;
        let work = workspace.root().join(&problem.id);

        let staged = (|| -> std::io::Result<()> {
            if work.exists() {
                fs::remove_dir_all(&work)?;
            }
            fs::create_dir_all(&work)?;
            fs::copy(&problem.baseline_path, work.join(BASELINE_COPY))?;
            Ok(())
        })();
        if let Err(e) = staged {
            workspace.mark_preserved();
            return RunOutcome::Crashed {
                detail: format!("failed to stage problem directory: {}", e),
            };
        }

        // Phase 1: the optimizer rewrites the staged baseline. The opaque
        // LLM backend selector is passed through untouched.
        let mut cmd = Command::new(&self.python_bin);
        cmd.arg(workspace.entry())
            .arg("--target")
            .arg(BASELINE_COPY)
            .arg("--output")
            .arg(OPTIMIZED_ARTIFACT)
            .current_dir(&work)
            .env("LLM_BACKEND", &self.llm_backend);

        let result = match self.exec(&mut cmd, None, budget).await {
            Ok(result) => result,
            Err(e) => {
                workspace.mark_preserved();
                return RunOutcome::Crashed {
                    detail: format!("failed to launch optimizer: {}", e),
                };
            }
        };

        if result.timed_out {
            workspace.mark_preserved();
            return RunOutcome::TimedOut { budget_ms };
        }
        if !result.exit_ok {
            workspace.mark_preserved();
            return RunOutcome::Crashed {
                detail: format!(
                    "optimizer exited with code {:?}; tail of stderr: {}",
                    result.exit_code,
                    tail(&result.stderr, 5)
                ),
            };
        }

        let artifact = work.join(OPTIMIZED_ARTIFACT);
        if !artifact.exists() {
            workspace.mark_preserved();
            return RunOutcome::Crashed {
                detail: format!("optimizer produced no {}", OPTIMIZED_ARTIFACT),
            };
        }

        // Phase 2: run the produced program over every test case, input on
        // stdin, output from stdout.
        let mut outputs = Vec::with_capacity(problem.tests.len());
        let mut elapsed_ms = 0.0;

        for test in &problem.tests {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                workspace.mark_preserved();
                return RunOutcome::TimedOut { budget_ms };
            }

            let mut cmd = Command::new(&self.python_bin);
            cmd.arg(&artifact).current_dir(&work);

            let result = match self.exec(&mut cmd, Some(&test.input), remaining).await {
                Ok(result) => result,
                Err(e) => {
                    workspace.mark_preserved();
                    return RunOutcome::Crashed {
                        detail: format!("failed to launch optimized program: {}", e),
                    };
                }
            };

            if result.timed_out {
                workspace.mark_preserved();
                return RunOutcome::TimedOut { budget_ms };
            }
            if !result.exit_ok {
                workspace.mark_preserved();
                return RunOutcome::Crashed {
                    detail: format!(
                        "optimized program exited with code {:?}; tail of stderr: {}",
                        result.exit_code,
                        tail(&result.stderr, 5)
                    ),
                };
            }

            elapsed_ms += result.elapsed_ms;
            outputs.push(result.stdout);
        }

        // Outputs are captured in memory; the problem directory can go.
        if let Err(e) = fs::remove_dir_all(&work) {
            warn!(path = %work.display(), error = %e, "failed to clean problem directory");
        }

        RunOutcome::Completed { outputs, elapsed_ms }
    }

    async fn measure_baseline(&self, problem: &BenchmarkProblem) -> Result<f64> {
        let work = tempfile::Builder::new()
            .prefix(&format!("baseline-{}-", problem.id))
            .tempdir_in(&self.scratch_dir)
            .context("failed to create baseline measurement directory")?;

        let program = work.path().join(BASELINE_COPY);
        fs::copy(&problem.baseline_path, &program)
            .context("failed to stage baseline program")?;

        let mut elapsed_ms = 0.0;
        for test in &problem.tests {
            let mut cmd = Command::new(&self.python_bin);
            cmd.arg(&program).current_dir(work.path());

            let result = self.exec(&mut cmd, Some(&test.input), self.setup_timeout).await?;
            if result.timed_out || !result.exit_ok {
                anyhow::bail!(
                    "baseline program for '{}' failed (exit {:?}, timed_out {})",
                    problem.id,
                    result.exit_code,
                    result.timed_out
                );
            }
            elapsed_ms += result.elapsed_ms;
        }

        Ok(elapsed_ms)
    }
}

/// Recursive copy used for directory payloads.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Archives zipped with an extra parent folder get flattened so the entry
/// point sits directly under the agent directory. OS metadata entries
/// (`__MACOSX`, dotfiles) do not count as content.
fn flatten_nested_dir(dir: &Path) -> std::io::Result<()> {
    let entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .map_or(false, |n| n != "__MACOSX" && !n.starts_with('.'))
        })
        .collect();

    let dirs: Vec<_> = entries.iter().filter(|e| e.path().is_dir()).collect();
    let files: Vec<_> = entries.iter().filter(|e| e.path().is_file()).collect();

    if dirs.len() == 1 && files.is_empty() {
        let nested = dirs[0].path();
        for entry in fs::read_dir(&nested)? {
            let entry = entry?;
            fs::rename(entry.path(), dir.join(entry.file_name()))?;
        }
        fs::remove_dir(nested)?;
    }
    Ok(())
}
