//! Periodic trigger for reconciliation passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::reconcile::{PassOutcome, Reconciler, SyncStats};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("scheduler not running")]
    NotRunning,
    #[error("failed to create scheduler: {0}")]
    CreationFailed(String),
    #[error("failed to start scheduler: {0}")]
    StartFailed(String),
    #[error("failed to stop scheduler: {0}")]
    StopFailed(String),
    #[error("failed to register job: {0}")]
    JobRegistrationFailed(String),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_on_start: bool,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            run_on_start: true,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    scheduler: Mutex<Option<JobScheduler>>,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<Reconciler>, config: SchedulerConfig) -> Self {
        Self {
            reconciler,
            config,
            scheduler: Mutex::new(None),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut slot = self.scheduler.lock().await;
        if slot.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let sched = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::CreationFailed(e.to_string()))?;

        let interval = self.config.interval;
        let reconciler = Arc::clone(&self.reconciler);
        let job = Job::new_repeated_async(interval, move |_uuid, _l| {
            let reconciler = Arc::clone(&reconciler);
            Box::pin(async move {
                reconciler.update_stats(|s| s.next_run_at = next_run(interval));
                match reconciler.run_pass().await {
                    PassOutcome::Busy => debug!("scheduled pass skipped; previous pass still running"),
                    PassOutcome::Failed { stage, error } => warn!(%stage, %error, "scheduled pass failed"),
                    PassOutcome::Completed(_) => {}
                }
            })
        })
        .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;
        sched
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobRegistrationFailed(e.to_string()))?;
        sched
            .start()
            .await
            .map_err(|e| SchedulerError::StartFailed(e.to_string()))?;
        *slot = Some(sched);

        self.reconciler.update_stats(|s| {
            s.running = true;
            s.next_run_at = next_run(interval);
        });
        info!(interval_secs = interval.as_secs(), "sync scheduler started");

        if self.config.run_on_start {
            let reconciler = Arc::clone(&self.reconciler);
            tokio::spawn(async move {
                reconciler.run_pass().await;
            });
        }
        Ok(())
    }

    /// Stops future triggers and waits up to the shutdown grace period for an
    /// in-flight pass.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut sched = self
            .scheduler
            .lock()
            .await
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        self.reconciler.update_stats(|s| {
            s.running = false;
            s.next_run_at = None;
        });
        sched
            .shutdown()
            .await
            .map_err(|e| SchedulerError::StopFailed(e.to_string()))?;

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.reconciler.is_syncing() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.reconciler.is_syncing() {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "pass still running after shutdown grace period"
            );
        }
        info!("sync scheduler stopped");
        Ok(())
    }

    /// Runs a pass immediately, outside the schedule.
    pub async fn force_run(&self) -> PassOutcome {
        info!("manual reconciliation requested");
        self.reconciler.run_pass().await
    }

    pub fn stats(&self) -> SyncStats {
        self.reconciler.stats()
    }
}

fn next_run(interval: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(interval).ok().map(|d| Utc::now() + d)
}
