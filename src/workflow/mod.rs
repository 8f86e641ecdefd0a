/// Workflow Management Layer
///
/// Workflow and step records, their SQLite persistence, and the per-kind
/// steps tables that drive routing:
/// - Type definitions (Workflow, WorkflowStep, StepContext)
/// - SQLite persistence with sqlx
/// - Compiled steps tables validated as DAGs with petgraph

// Core workflow type definitions
pub mod types;

// SQLite persistence for workflows and workflow_steps
pub mod storage;

// StepsConfig tables and their registry
pub mod registry;

// Built-in tables per workflow kind
pub mod definitions;

// Re-export commonly used types
pub use registry::{StepTransition, StepsConfig, StepsConfigRegistry};
pub use storage::{Successors, WorkflowStorage};
pub use types::{
    StepContext, StepStatus, Workflow, WorkflowKind, WorkflowStatus, WorkflowStep, INIT,
    MARK_FAILURE, MARK_SUCCESS,
};
