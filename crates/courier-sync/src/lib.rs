//! Courier status reconciliation: policy, pass orchestration, notification
//! gating, profit protection, and the periodic scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_adapters::WaseetClient;
use courier_storage::{HttpClientConfig, HttpFetcher, PgOrderStore};
use tracing::info;

pub mod config;
pub mod notify;
pub mod profit;
pub mod reconcile;
pub mod scheduler;

pub use config::{SyncConfig, SyncPolicy};
pub use notify::{
    GateRefusal, LogSender, NotificationGate, NotificationMessage, NotificationSender, NotifyError,
    SendReceipt, WebhookSender,
};
pub use profit::{GuardReport, ProfitGuard};
pub use reconcile::{
    decide, Decision, PassOutcome, PassReport, PassStage, Reconciler, SkipCounts, SkipReason, SyncStats,
};
pub use scheduler::{SchedulerConfig, SchedulerError, SyncScheduler};

pub const CRATE_NAME: &str = "courier-sync";

/// Fully wired reconciliation service.
pub struct SyncService {
    pub config: SyncConfig,
    pub policy: SyncPolicy,
    pub reconciler: Arc<Reconciler>,
    pub scheduler: Arc<SyncScheduler>,
}

impl SyncService {
    pub async fn from_env() -> Result<Self> {
        Self::build(SyncConfig::from_env()).await
    }

    pub async fn build(config: SyncConfig) -> Result<Self> {
        let policy = SyncPolicy::load(&config.policy_path)?;
        let store = PgOrderStore::connect(
            &config.database_url,
            config.database_max_connections,
            config.store_timeout,
        )
        .await?;
        let courier = WaseetClient::new(config.waseet.clone()).context("building courier client")?;
        let sender = notification_sender(&config)?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::new(courier),
            Arc::new(store),
            sender,
            &policy,
            config.store_timeout,
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            Arc::clone(&reconciler),
            SchedulerConfig {
                interval: config.sync_interval,
                run_on_start: config.run_on_start,
                shutdown_grace: config.shutdown_grace,
            },
        ));
        info!(
            courier = reconciler.courier_name(),
            interval_secs = config.sync_interval.as_secs(),
            policy = %config.policy_path.display(),
            "sync service ready"
        );
        Ok(Self {
            config,
            policy,
            reconciler,
            scheduler,
        })
    }
}

/// Webhook delivery when a relay URL is configured, log-only otherwise.
pub fn notification_sender(config: &SyncConfig) -> Result<Arc<dyn NotificationSender>> {
    match &config.push_webhook_url {
        Some(url) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: config.waseet.http.timeout,
                user_agent: Some(config.user_agent.clone()),
                backoff: config.waseet.http.backoff,
            })
            .context("building push webhook client")?;
            Ok(Arc::new(WebhookSender::new(http, url.clone())))
        }
        None => {
            info!("PUSH_WEBHOOK_URL not set; notifications are logged only");
            Ok(Arc::new(LogSender))
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<PassOutcome> {
    let service = SyncService::from_env().await?;
    Ok(service.reconciler.run_pass().await)
}
