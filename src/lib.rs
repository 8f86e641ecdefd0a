/// economyflow: persisted, resumable workflow orchestration for token economies
///
/// Multi-step business processes run as directed graphs of steps, one step
/// per router call, with every outcome persisted. Per-lane cron locks and a
/// monotonic sequence gate keep a single worker advancing each chain's work
/// in order.

// Core configuration and setup
pub mod config;

// Engine error type
pub mod error;

// SQLite pool and schema
pub mod database;

// Workflow management layer - records, storage and steps tables
pub mod workflow;

// Lane management layer - cron lock rows, leases and the sequence gate
pub mod lane;

// Runtime layer - router, dispatch, workers and maintenance jobs
pub mod runtime;

// Step implementations bundled with the engine
pub mod steps;

// HTTP API layer - workflow triggers and lane operator endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, Result};
pub use lane::{AcquireResult, LaneKey, SequenceCheck, SequenceGate};
pub use runtime::{AdvanceOutcome, StepHandler, StepHandlers, StepOutcome, WorkflowRouter};
pub use server::start_server;
pub use workflow::{StepContext, StepStatus, Workflow, WorkflowKind, WorkflowStatus, WorkflowStep};
