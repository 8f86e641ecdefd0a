/// Runtime Execution Layer
///
/// Moves workflows forward:
/// - Step implementation contract and handler registry
/// - Topic-keyed dispatch channel
/// - Workflow router (one step per call)
/// - Lane workers gated by the cron lock and sequence check
/// - Reconciliation sweep and the maintenance scheduler

// Step implementation contract and handler registry
pub mod step;

// Dispatch channel between the router and lane workers
pub mod dispatch;

// Shared step-advancing engine for every workflow kind
pub mod router;

// Stuck pending / lost queued step recovery
pub mod reconcile;

// Lane-bound consumers of the dispatch channel
pub mod worker;

// Background maintenance jobs using tokio-cron-scheduler
pub mod scheduler;

// Re-export main types
pub use dispatch::{ChannelDispatcher, DispatchMessage, Dispatcher};
pub use reconcile::{ReconcileReport, Reconciler};
pub use router::{AdvanceOutcome, TimeoutResolution, WorkflowRouter};
pub use scheduler::MaintenanceScheduler;
pub use step::{StepError, StepHandler, StepHandlers, StepOutcome, TaskStatus};
pub use worker::{LaneWorker, WorkerSettings};
