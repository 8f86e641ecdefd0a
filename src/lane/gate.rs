/// Cron lock & sequence gate
///
/// Serializes advancement of a lane. Acquisition and sequence checks never
/// block: contention comes back as `AcquireResult::NotAcquired` or
/// `SequenceCheck::NotYourTurn` and the caller decides when to retry.
///
/// Held leases live in an ArcSwap map so the heartbeat job reads them
/// lock-free; acquire/release go through `rcu` so concurrent updates are not lost.

use crate::{
    error::{EngineError, Result},
    lane::{
        storage::CronProcessStorage,
        types::{AcquireResult, CronProcess, LaneKey, LaneLease, SequenceCheck},
    },
};
use arc_swap::ArcSwap;
use chrono::Utc;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use uuid::Uuid;

/// Result of one heartbeat round
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub refreshed: usize,
    /// Lanes whose row was stopped or taken over behind our back
    pub lost: Vec<LaneKey>,
}

#[derive(Debug)]
pub struct SequenceGate {
    storage: CronProcessStorage,
    /// Key: lane key string, Value: lease held by this process
    held: ArcSwap<HashMap<String, LaneLease>>,
}

impl SequenceGate {
    pub fn new(storage: CronProcessStorage) -> Self {
        Self {
            storage,
            held: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> &CronProcessStorage {
        &self.storage
    }

    /// Register a new lane in `stopped` status
    pub async fn register(
        &self,
        lane_key: &LaneKey,
        params: &Value,
        initial_sequence: i64,
    ) -> Result<CronProcess> {
        let process = self.storage.register(lane_key, params, initial_sequence).await?;
        tracing::info!("📝 Registered lane {} (sequence starts at {})", lane_key, initial_sequence);
        Ok(process)
    }

    pub async fn lane(&self, lane_key: &LaneKey) -> Result<Option<CronProcess>> {
        self.storage.get(lane_key).await
    }

    pub async fn lanes(&self) -> Result<Vec<CronProcess>> {
        self.storage.list().await
    }

    /// Try to become the single running holder of a lane
    ///
    /// Fails closed: an already running lane yields `NotAcquired` and nothing is written.
    pub async fn try_acquire(&self, lane_key: &LaneKey) -> Result<AcquireResult> {
        if self.storage.get(lane_key).await?.is_none() {
            return Err(EngineError::LaneNotFound(lane_key.to_string()));
        }

        let owner = Uuid::new_v4().to_string();
        if !self.storage.try_mark_running(lane_key, &owner).await? {
            tracing::debug!("🔒 Lane {} is already running elsewhere", lane_key);
            return Ok(AcquireResult::NotAcquired);
        }

        let lease = LaneLease::new(lane_key.clone(), owner);
        self.held.rcu(|current| {
            let mut held = (**current).clone();
            held.insert(lane_key.to_string(), lease.clone());
            held
        });

        tracing::info!("🔓 Acquired lane {} (owner {})", lane_key, lease.owner);
        Ok(AcquireResult::Acquired(lease))
    }

    /// Accept `candidate` only if it is exactly the stored sequence + 1
    pub async fn check_and_advance_sequence(
        &self,
        lane_key: &LaneKey,
        candidate: i64,
    ) -> Result<SequenceCheck> {
        if self.storage.advance_sequence(lane_key, candidate).await? {
            tracing::debug!("🔢 Lane {} advanced to sequence {}", lane_key, candidate);
            return Ok(SequenceCheck::Accepted {
                sequence_number: candidate,
            });
        }

        let current = self
            .storage
            .current_sequence(lane_key)
            .await?
            .ok_or_else(|| EngineError::LaneNotFound(lane_key.to_string()))?;

        tracing::debug!(
            "⏳ Lane {} rejected sequence {} (current {})",
            lane_key,
            candidate,
            current
        );
        Ok(SequenceCheck::NotYourTurn { current })
    }

    /// Give the lane back; false when this process did not hold it
    pub async fn release(&self, lane_key: &LaneKey) -> Result<bool> {
        let Some(lease) = self.forget(lane_key, None) else {
            return Ok(false);
        };

        let released = self.storage.mark_stopped(lane_key, &lease.owner).await?;
        if released {
            tracing::info!("🔐 Released lane {}", lane_key);
        } else {
            tracing::warn!("⚠️ Lane {} was no longer ours at release", lane_key);
        }
        Ok(released)
    }

    /// Refresh every held lease; leases whose row was stopped or re-owned are marked lost
    pub async fn heartbeat_all(&self) -> Result<HeartbeatReport> {
        let mut report = HeartbeatReport::default();
        let held = self.held.load_full();

        for lease in held.values() {
            if self.storage.heartbeat(&lease.lane_key, &lease.owner).await? {
                report.refreshed += 1;
            } else {
                tracing::warn!("💔 Lost lane {}: row no longer running under our owner", lease.lane_key);
                lease.mark_lost();
                self.forget(&lease.lane_key, Some(&lease.owner));
                report.lost.push(lease.lane_key.clone());
            }
        }

        Ok(report)
    }

    /// Running lanes whose heartbeat is older than `threshold`
    pub async fn stale_locks(&self, threshold: Duration) -> Result<Vec<CronProcess>> {
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| EngineError::Configuration(format!("stale threshold: {}", e)))?;
        self.storage.stale_running(Utc::now() - threshold).await
    }

    /// Operator path: stop a lane whoever holds it
    ///
    /// The holding worker finds out on its next heartbeat and stops.
    pub async fn force_release(&self, lane_key: &LaneKey) -> Result<bool> {
        if self.storage.get(lane_key).await?.is_none() {
            return Err(EngineError::LaneNotFound(lane_key.to_string()));
        }

        let stopped = self.storage.force_stop(lane_key).await?;
        if stopped {
            tracing::warn!("🛑 Force-released lane {}", lane_key);
        }
        Ok(stopped)
    }

    pub fn held_leases(&self) -> Vec<LaneLease> {
        self.held.load().values().cloned().collect()
    }

    /// Drop the held lease of `lane_key`, only if it still carries `owner` when given
    fn forget(&self, lane_key: &LaneKey, owner: Option<&str>) -> Option<LaneLease> {
        let key = lane_key.to_string();
        let matches = |lease: &LaneLease| owner.map_or(true, |owner| lease.owner == owner);

        let previous = self.held.rcu(|current| {
            let mut held = (**current).clone();
            if held.get(&key).is_some_and(|lease| matches(lease)) {
                held.remove(&key);
            }
            held
        });
        previous.get(&key).filter(|lease| matches(lease)).cloned()
    }
}
