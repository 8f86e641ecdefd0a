/// Lane Management Layer
///
/// Cron lock rows, heartbeat-tracked leases and the per-lane sequence gate
/// that keeps one worker per chain applying work in order.

// Lane keys, lock rows, leases and gate outcomes
pub mod types;

// SQLite persistence for cron_processes
pub mod storage;

// Acquire / sequence-check / release / heartbeat
pub mod gate;

pub use gate::{HeartbeatReport, SequenceGate};
pub use storage::CronProcessStorage;
pub use types::{AcquireResult, CronProcess, LaneKey, LaneLease, LaneStatus, SequenceCheck};
