/// Background maintenance scheduler
///
/// Runs the periodic jobs that keep lanes and workflows healthy using
/// tokio-cron-scheduler:
/// - lease heartbeat (refresh held lanes, flag lost ones)
/// - reconciliation sweep (stuck pending / lost queued steps)
/// - stale lock audit (warn only; releasing is an operator decision)

use crate::{
    config::MaintenanceConfig,
    error::Result,
    lane::gate::SequenceGate,
    runtime::reconcile::Reconciler,
};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

const HEARTBEAT_JOB: &str = "heartbeat";
const RECONCILE_JOB: &str = "reconcile";
const STALE_AUDIT_JOB: &str = "staleLockAudit";

pub struct MaintenanceScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid_map: Arc<RwLock<HashMap<String, Uuid>>>, // Track job UUIDs for removal on shutdown
    gate: Arc<SequenceGate>,
    reconciler: Arc<Reconciler>,
    config: MaintenanceConfig,
}

impl MaintenanceScheduler {
    pub async fn new(
        gate: Arc<SequenceGate>,
        reconciler: Arc<Reconciler>,
        config: MaintenanceConfig,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid_map: Arc::new(RwLock::new(HashMap::new())),
            gate,
            reconciler,
            config,
        })
    }

    /// Register the maintenance jobs and start ticking
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting maintenance scheduler");

        self.add_heartbeat_job().await?;
        self.add_reconcile_job().await?;
        self.add_stale_audit_job().await?;

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await?;
        }

        tracing::info!("✅ Maintenance scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping maintenance scheduler");

        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            let scheduler = self.scheduler.read().await;
            for (name, job_uuid) in job_uuid_map.drain() {
                if let Err(e) = scheduler.remove(&job_uuid).await {
                    tracing::warn!("⚠️ Failed to remove job {} from scheduler: {}", name, e);
                }
            }
        }

        {
            let mut scheduler = self.scheduler.write().await;
            scheduler.shutdown().await?;
        }

        tracing::info!("✅ Maintenance scheduler stopped");
        Ok(())
    }

    /// Names of the registered jobs
    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.job_uuid_map.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn add_heartbeat_job(&self) -> Result<()> {
        let gate = Arc::clone(&self.gate);

        let job = Job::new_async(self.config.heartbeat_schedule.as_str(), move |_uuid, _l| {
            let gate = Arc::clone(&gate);

            Box::pin(async move {
                match gate.heartbeat_all().await {
                    Ok(report) if !report.lost.is_empty() => {
                        tracing::warn!("💔 Heartbeat lost {} lane(s): {:?}", report.lost.len(), report.lost);
                    }
                    Ok(report) => tracing::debug!("💓 Heartbeat refreshed {} lane(s)", report.refreshed),
                    Err(e) => tracing::error!("❌ Heartbeat failed: {}", e),
                }
            })
        })?;

        self.add_job(HEARTBEAT_JOB, job, &self.config.heartbeat_schedule).await
    }

    async fn add_reconcile_job(&self) -> Result<()> {
        let reconciler = Arc::clone(&self.reconciler);

        let job = Job::new_async(self.config.reconcile_schedule.as_str(), move |_uuid, _l| {
            let reconciler = Arc::clone(&reconciler);

            Box::pin(async move {
                if let Err(e) = reconciler.sweep().await {
                    tracing::error!("❌ Reconciliation sweep failed: {}", e);
                }
            })
        })?;

        self.add_job(RECONCILE_JOB, job, &self.config.reconcile_schedule).await
    }

    /// Shares the reconcile cadence
    async fn add_stale_audit_job(&self) -> Result<()> {
        let gate = Arc::clone(&self.gate);
        let threshold = Duration::from_secs(self.config.stale_lock_secs);

        let job = Job::new_async(self.config.reconcile_schedule.as_str(), move |_uuid, _l| {
            let gate = Arc::clone(&gate);

            Box::pin(async move {
                match gate.stale_locks(threshold).await {
                    Ok(stale) => {
                        for process in stale {
                            tracing::warn!(
                                "🧟 Lane {} looks stale (owner {:?}, last heartbeat {:?}); force-release it if its worker is gone",
                                process.lane_key,
                                process.owner,
                                process.last_heartbeat_at
                            );
                        }
                    }
                    Err(e) => tracing::error!("❌ Stale lock audit failed: {}", e),
                }
            })
        })?;

        self.add_job(STALE_AUDIT_JOB, job, &self.config.reconcile_schedule).await
    }

    async fn add_job(&self, name: &str, job: Job, schedule: &str) -> Result<()> {
        let job_uuid = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await?
        };

        {
            let mut job_uuid_map = self.job_uuid_map.write().await;
            job_uuid_map.insert(name.to_string(), job_uuid);
        }

        tracing::info!("📝 Scheduled {} job ({})", name, schedule);
        Ok(())
    }
}
