pub mod config;
pub mod store;
pub mod types;

// Re-export commonly used types for convenience
pub use config::Config;
pub use store::{EnqueueRequest, JobStore, MemoryJobStore, QueueCounts, RedisJobStore, StoreError};
pub use types::{AggregateResult, CompletedRun, ProblemResult, Submission, SubmissionStatus};
