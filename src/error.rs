/// Error types for the orchestration engine
///
/// Library code returns `EngineError`; the server and CLI layers wrap it with
/// anyhow context at the edges.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by storage, routing and lane gating
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed steps table, unknown step kind or missing step handler.
    /// Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("Workflow step not found: {0}")]
    StepNotFound(Uuid),

    #[error("Lane not registered: {0}")]
    LaneNotFound(String),

    #[error("Invalid lane key '{0}': expected <process>:<chain_id>[:<group_id>]")]
    InvalidLaneKey(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),

    /// A persisted value that does not parse back (status, kind, timestamp)
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, EngineError>;
