/// Lane type definitions
///
/// A lane is the unit of serialization for workers: a process kind on one
/// chain, optionally split further by a group id.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Process kind of the lanes that advance workflow steps
pub const WORKFLOW_ROUTER: &str = "workflowRouter";

/// Identity of a lane: `<process>:<chain_id>[:<group_id>]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LaneKey {
    pub process: String,
    /// 0 for chain-agnostic work
    pub chain_id: u64,
    pub group_id: Option<String>,
}

impl LaneKey {
    pub fn new(process: impl Into<String>, chain_id: u64) -> Self {
        Self {
            process: process.into(),
            chain_id,
            group_id: None,
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Lane advancing the workflows of `chain_id` (chain-agnostic workflows share lane 0)
    pub fn workflow_router(chain_id: Option<u64>) -> Self {
        Self::new(WORKFLOW_ROUTER, chain_id.unwrap_or(0))
    }
}

impl fmt::Display for LaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process, self.chain_id)?;
        if let Some(group) = &self.group_id {
            write!(f, ":{}", group)?;
        }
        Ok(())
    }
}

impl FromStr for LaneKey {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidLaneKey(s.to_string());
        let mut parts = s.splitn(3, ':');

        let process = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        let chain_id = parts
            .next()
            .and_then(|raw| raw.parse::<u64>().ok())
            .ok_or_else(invalid)?;
        let group_id = match parts.next() {
            Some("") => return Err(invalid()),
            Some(group) => Some(group.to_string()),
            None => None,
        };

        Ok(Self {
            process: process.to_string(),
            chain_id,
            group_id,
        })
    }
}

/// Lock row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LaneStatus {
    Running,
    Stopped,
}

impl LaneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaneStatus::Running => "running",
            LaneStatus::Stopped => "stopped",
        }
    }
}

impl FromStr for LaneStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(LaneStatus::Running),
            "stopped" => Ok(LaneStatus::Stopped),
            other => Err(EngineError::CorruptRecord(format!("lane status '{}'", other))),
        }
    }
}

/// A `cron_processes` row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronProcess {
    pub id: i64,
    pub kind: String,
    pub lane_key: LaneKey,
    pub status: LaneStatus,
    /// Token of the current holder while running
    pub owner: Option<String>,
    /// Lane-specific configuration: chain id, prefetch count
    pub params: Value,
    /// Last accepted unit of work
    pub sequence_number: i64,
    /// Last sequence stamped onto a dispatched step
    pub issued_sequence: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronProcess {
    /// Batch size requested by the lane params, if any
    pub fn prefetch(&self) -> Option<usize> {
        self.params
            .get("prefetch")
            .and_then(Value::as_u64)
            .filter(|count| *count > 0)
            .map(|count| count as usize)
    }
}

/// In-memory proof that this process holds a lane lock row
///
/// The `lost` flag is shared by clones; the heartbeat job raises it when the
/// row is no longer running under our owner token.
#[derive(Debug, Clone)]
pub struct LaneLease {
    pub lane_key: LaneKey,
    pub owner: String,
    lost: Arc<AtomicBool>,
}

impl LaneLease {
    pub fn new(lane_key: LaneKey, owner: String) -> Self {
        Self {
            lane_key,
            owner,
            lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

/// Outcome of `try_acquire`; contention is a value, not an error
#[derive(Debug, Clone)]
pub enum AcquireResult {
    Acquired(LaneLease),
    NotAcquired,
}

/// Outcome of `check_and_advance_sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Stored value is now `sequence_number`
    Accepted { sequence_number: i64 },
    /// Candidate was not `current + 1`; nothing changed
    NotYourTurn { current: i64 },
}
