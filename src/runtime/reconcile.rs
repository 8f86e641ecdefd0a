/// Reconciliation sweep
///
/// Resolves work that would otherwise be stranded: steps left `pending` past
/// the threshold are timed out (then retried or failed over), and `queued`
/// steps whose dispatch may have been lost are published again.

use crate::{
    error::{EngineError, Result},
    runtime::router::{TimeoutResolution, WorkflowRouter},
    workflow::types::StepStatus,
};
use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Steps handled per status per sweep
const SWEEP_BATCH: i64 = 100;

/// Counters of one sweep
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub timed_out: usize,
    pub retried: usize,
    pub failure_routed: usize,
    pub redispatched: usize,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    router: Arc<WorkflowRouter>,
    pending_timeout: Duration,
    queued_timeout: Duration,
}

impl Reconciler {
    pub fn new(router: Arc<WorkflowRouter>, pending_timeout: Duration, queued_timeout: Duration) -> Self {
        Self {
            router,
            pending_timeout,
            queued_timeout,
        }
    }

    pub async fn sweep(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let storage = self.router.storage();

        let pending_cutoff = Utc::now() - to_chrono(self.pending_timeout)?;
        for step in storage
            .steps_older_than(StepStatus::Pending, pending_cutoff, SWEEP_BATCH)
            .await?
        {
            match self.router.reconcile_timeout(&step).await {
                Ok(TimeoutResolution::Retried { .. }) => {
                    report.timed_out += 1;
                    report.retried += 1;
                }
                Ok(TimeoutResolution::FailureRouted { .. }) => {
                    report.timed_out += 1;
                    report.failure_routed += 1;
                }
                Ok(TimeoutResolution::Skipped) => {}
                Err(e) => tracing::error!("❌ Failed to reconcile pending step {}: {}", step.id, e),
            }
        }

        let queued_cutoff = Utc::now() - to_chrono(self.queued_timeout)?;
        for step in storage
            .steps_older_than(StepStatus::Queued, queued_cutoff, SWEEP_BATCH)
            .await?
        {
            match self.router.redispatch(&step).await {
                Ok(true) => report.redispatched += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("❌ Failed to re-dispatch queued step {}: {}", step.id, e),
            }
        }

        if report != ReconcileReport::default() {
            tracing::info!(
                "🧹 Reconciliation: {} timed out ({} retried, {} failed over), {} re-dispatched",
                report.timed_out,
                report.retried,
                report.failure_routed,
                report.redispatched
            );
        }
        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| EngineError::Configuration(format!("sweep threshold: {}", e)))
}
