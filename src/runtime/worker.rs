/// Lane worker
///
/// Polls for the lane lock, consumes its dispatch topic in prefetch-sized
/// batches, passes each message through the sequence gate and asks the router
/// to advance the step. Stops consuming as soon as the heartbeat reports the
/// lease lost and goes back to polling for the lock.

use crate::{
    error::{EngineError, Result},
    lane::{
        gate::SequenceGate,
        types::{AcquireResult, LaneKey, LaneLease, SequenceCheck},
    },
    runtime::{
        dispatch::{requeue_after, ChannelDispatcher, DispatchMessage, Dispatcher},
        router::{AdvanceOutcome, WorkflowRouter},
    },
};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

/// Timing knobs of a worker
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub default_prefetch: usize,
}

#[derive(Debug, Clone)]
pub struct LaneWorker {
    lane_key: LaneKey,
    gate: Arc<SequenceGate>,
    router: Arc<WorkflowRouter>,
    dispatcher: Arc<ChannelDispatcher>,
    settings: WorkerSettings,
}

impl LaneWorker {
    pub fn new(
        lane_key: LaneKey,
        gate: Arc<SequenceGate>,
        router: Arc<WorkflowRouter>,
        dispatcher: Arc<ChannelDispatcher>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            lane_key,
            gate,
            router,
            dispatcher,
            settings,
        }
    }

    /// Run on a background task until `shutdown` flips to true
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let lane_key = self.lane_key.clone();
            if let Err(e) = self.run(shutdown).await {
                tracing::error!("❌ Worker for lane {} stopped: {}", lane_key, e);
            }
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("👷 Worker started for lane {}", self.lane_key);

        while let Some(lease) = self.acquire(&mut shutdown).await? {
            let consumed = self.consume(&lease, &mut shutdown).await;

            if lease.is_lost() {
                tracing::warn!("💔 Worker for lane {} lost its lease; back to polling", self.lane_key);
            } else {
                self.gate.release(&self.lane_key).await?;
            }
            if consumed? {
                break;
            }
        }

        tracing::info!("👋 Worker for lane {} stopped", self.lane_key);
        Ok(())
    }

    /// Poll until the lane lock is ours; None on shutdown
    async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Option<LaneLease>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            match self.gate.try_acquire(&self.lane_key).await {
                Ok(AcquireResult::Acquired(lease)) => return Ok(Some(lease)),
                Ok(AcquireResult::NotAcquired) => {
                    tracing::debug!("🔒 Lane {} busy; retrying in {:?}", self.lane_key, self.settings.poll_interval)
                }
                Err(EngineError::LaneNotFound(_)) => {
                    tracing::warn!("⚠️ Lane {} is not registered yet", self.lane_key)
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Consume the lane topic while the lease holds; true when shutting down
    async fn consume(&self, lease: &LaneLease, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        let topic = self.lane_key.to_string();
        let mut receiver = self.dispatcher.subscribe(&topic).await?;

        let prefetch = self
            .gate
            .lane(&self.lane_key)
            .await?
            .and_then(|process| process.prefetch())
            .unwrap_or(self.settings.default_prefetch)
            .max(1);
        tracing::debug!("📥 Consuming {} with prefetch {}", topic, prefetch);

        let mut batch = Vec::with_capacity(prefetch);
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        let stopping = loop {
            if *shutdown.borrow() {
                break true;
            }
            if lease.is_lost() {
                break false;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break true;
                    }
                }
                _ = ticker.tick() => {}
                received = receiver.recv_many(&mut batch, prefetch) => {
                    if received == 0 {
                        break true;
                    }
                    // Gate-ordered messages first, lowest sequence first
                    batch.sort_by_key(|message| (message.sequence_number.is_none(), message.sequence_number));
                    for message in batch.drain(..) {
                        if lease.is_lost() {
                            self.dispatcher.publish(message).await?;
                        } else {
                            self.handle(message).await;
                        }
                    }
                }
            }
        };

        self.dispatcher.unsubscribe(&topic, receiver).await;
        Ok(stopping)
    }

    /// Gate check, then advance; failures are logged, never fatal for the worker
    async fn handle(&self, message: DispatchMessage) {
        if let Some(candidate) = message.sequence_number {
            match self.gate.check_and_advance_sequence(&self.lane_key, candidate).await {
                Ok(SequenceCheck::Accepted { .. }) => {}
                Ok(SequenceCheck::NotYourTurn { current }) if candidate > current => {
                    tracing::debug!(
                        "⏳ Sequence {} on {} waits for {}; requeueing",
                        candidate,
                        self.lane_key,
                        current + 1
                    );
                    requeue_after(self.dispatcher.clone(), message, self.settings.retry_delay);
                    return;
                }
                Ok(SequenceCheck::NotYourTurn { current }) => {
                    tracing::debug!(
                        "🔁 Sequence {} on {} already consumed (current {}); advancing idempotently",
                        candidate,
                        self.lane_key,
                        current
                    );
                }
                Err(e) => {
                    tracing::error!("❌ Sequence check failed on {}: {}", self.lane_key, e);
                    requeue_after(self.dispatcher.clone(), message, self.settings.retry_delay);
                    return;
                }
            }
        }

        match self.router.advance(message.workflow_id, message.step_id).await {
            Ok(AdvanceOutcome::Deferred) => {
                requeue_after(
                    self.dispatcher.clone(),
                    message.without_sequence(),
                    self.settings.retry_delay,
                );
            }
            Ok(outcome) => {
                tracing::debug!("📍 Step {} advanced: {:?}", message.step_id, outcome);
            }
            Err(e) => {
                tracing::error!(
                    "❌ Failed to advance step {} of workflow {}: {}",
                    message.step_id,
                    message.workflow_id,
                    e
                );
            }
        }
    }
}
