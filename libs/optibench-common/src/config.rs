use std::path::PathBuf;

/// Configuration surface consumed by the pipeline, read from the
/// environment with defaults that match the reference deployment.
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Number of concurrent workers.
    pub parallelism: usize,
    /// Hard wall-clock budget covering one submission's full benchmark run;
    /// subdivided per problem by the worker.
    pub per_submission_timeout_secs: u64,
    /// Budget for archive extraction and dependency installation,
    /// independent of the per-problem budget.
    pub setup_timeout_secs: u64,
    /// Opaque selector passed through to the submission's execution
    /// environment untouched.
    pub llm_backend: String,
    /// Root directory of benchmark problem definitions.
    pub problems_dir: PathBuf,
    /// Where the upload boundary stores submission archives.
    pub submissions_dir: PathBuf,
    /// Scratch root for sandbox working directories.
    pub scratch_dir: PathBuf,
    /// Filename of the optimizer entry point inside a submission archive.
    pub optimizer_entry: String,
    /// Interpreter used to run submission and baseline programs.
    pub python_bin: String,
    /// Idle worker poll interval.
    pub poll_interval_ms: u64,
    /// Bind address for the HTTP API.
    pub listen_addr: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
            parallelism: env_parse("WORKER_PARALLELISM", 4),
            per_submission_timeout_secs: env_parse("SUBMISSION_TIMEOUT_SECS", 180),
            setup_timeout_secs: env_parse("SETUP_TIMEOUT_SECS", 120),
            llm_backend: env_or("LLM_BACKEND", "ollama"),
            problems_dir: PathBuf::from(env_or("PROBLEMS_DIR", "assets/problems")),
            submissions_dir: PathBuf::from(env_or("SUBMISSIONS_DIR", "data/submissions")),
            scratch_dir: PathBuf::from(env_or("SCRATCH_DIR", "data/scratch")),
            optimizer_entry: env_or("OPTIMIZER_ENTRY", "optimize.py"),
            python_bin: env_or("PYTHON_BIN", "python3"),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", 1000),
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8081"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        std::env::remove_var("SUBMISSION_TIMEOUT_SECS");
        std::env::remove_var("OPTIMIZER_ENTRY");
        let config = Config::from_env();
        assert_eq!(config.per_submission_timeout_secs, 180);
        assert_eq!(config.optimizer_entry, "optimize.py");
        assert_eq!(config.llm_backend, "ollama");
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("OPTIBENCH_TEST_PARSE", "not-a-number");
        assert_eq!(env_parse("OPTIBENCH_TEST_PARSE", 7usize), 7);
        std::env::remove_var("OPTIBENCH_TEST_PARSE");
    }

    #[test]
    fn test_env_or_uses_default_when_unset() {
        std::env::remove_var("OPTIBENCH_TEST_MISSING");
        assert_eq!(env_or("OPTIBENCH_TEST_MISSING", "fallback"), "fallback");
    }
}
