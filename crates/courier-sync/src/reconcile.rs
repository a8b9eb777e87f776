//! One reconciliation pass: courier listing → local orders → guarded writes →
//! notifications → hand-off of unsent orders.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_adapters::{CourierClient, StatusMapper};
use courier_core::{CanonicalStatus, NewCourierOrder, Order, RemoteOrder, StatusPatch};
use courier_storage::{OrderStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SyncPolicy;
use crate::notify::{NotificationGate, NotificationSender};
use crate::profit::ProfitGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStage {
    FetchingRemote,
    FetchingLocal,
    Matching,
    Applying,
    HandingOff,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassStage::FetchingRemote => "fetching-remote",
            PassStage::FetchingLocal => "fetching-local",
            PassStage::Matching => "matching",
            PassStage::Applying => "applying",
            PassStage::HandingOff => "handing-off",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Unchanged,
    TooSoon,
    WouldRegress,
    BecameTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCounts {
    pub unchanged: usize,
    pub too_soon: usize,
    pub would_regress: usize,
    pub became_terminal: usize,
}

impl SkipCounts {
    pub fn record(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::Unchanged => self.unchanged += 1,
            SkipReason::TooSoon => self.too_soon += 1,
            SkipReason::WouldRegress => self.would_regress += 1,
            SkipReason::BecameTerminal => self.became_terminal += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.unchanged + self.too_soon + self.would_regress + self.became_terminal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub remote_orders: usize,
    pub local_candidates: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub ignored: usize,
    pub duplicates: usize,
    pub updated: usize,
    pub skipped: SkipCounts,
    pub failed_updates: usize,
    pub notifications_sent: usize,
    pub profit_reverts: usize,
    pub handoffs_attempted: usize,
    pub handoffs_submitted: usize,
    pub handoffs_failed: usize,
}

impl PassReport {
    fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            remote_orders: 0,
            local_candidates: 0,
            matched: 0,
            unmatched: 0,
            ignored: 0,
            duplicates: 0,
            updated: 0,
            skipped: SkipCounts::default(),
            failed_updates: 0,
            notifications_sent: 0,
            profit_reverts: 0,
            handoffs_attempted: 0,
            handoffs_submitted: 0,
            handoffs_failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Another pass held the lock; nothing was done.
    Busy,
    Completed(PassReport),
    Failed { stage: PassStage, error: String },
}

impl PassOutcome {
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            PassOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }
}

/// Serializable snapshot of the process-local sync state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub running: bool,
    pub currently_syncing: bool,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_passes: u64,
    pub successful_passes: u64,
    pub failed_passes: u64,
    pub busy_skips: u64,
    pub orders_updated: u64,
    pub orders_skipped: u64,
    pub notifications_sent: u64,
    pub profit_reverts: u64,
    pub handoffs_submitted: u64,
    pub last_error: Option<String>,
    pub last_report: Option<PassReport>,
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub ignored_codes: HashSet<i64>,
    pub min_update_interval: chrono::Duration,
    pub handoff_batch_size: usize,
    pub profit_guard_enabled: bool,
    pub store_timeout: Duration,
}

impl ReconcilerSettings {
    pub fn from_policy(policy: &SyncPolicy, store_timeout: Duration) -> Self {
        Self {
            ignored_codes: policy.ignored_codes.iter().copied().collect(),
            min_update_interval: policy.min_update_interval(),
            handoff_batch_size: policy.handoff_batch_size,
            profit_guard_enabled: policy.profit_guard_enabled,
            store_timeout,
        }
    }
}

/// Decides whether a mapped courier status should be written to `order`.
pub fn decide(
    order: &Order,
    status: CanonicalStatus,
    persisted_code: Option<i64>,
    courier_text: &str,
    now: DateTime<Utc>,
    min_update_interval: chrono::Duration,
) -> Decision {
    if status.is_pre_dispatch() && order.is_dispatched() && !order.status.is_pre_dispatch() {
        return Decision::Skip(SkipReason::WouldRegress);
    }

    let same_text = order
        .courier_status_text
        .as_deref()
        .map(str::trim)
        .is_some_and(|t| t == courier_text.trim());
    if order.status == status && order.courier_status_code == persisted_code && same_text {
        return Decision::Skip(SkipReason::Unchanged);
    }

    if let Some(updated_at) = order.status_updated_at {
        if now - updated_at < min_update_interval {
            return Decision::Skip(SkipReason::TooSoon);
        }
    }
    Decision::Apply
}

struct SyncingFlag<'a>(&'a AtomicBool);

impl<'a> SyncingFlag<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PassFailure {
    stage: PassStage,
    error: String,
}

impl PassFailure {
    fn at(stage: PassStage, err: impl fmt::Display) -> Self {
        Self {
            stage,
            error: err.to_string(),
        }
    }
}

pub struct Reconciler {
    courier: Arc<dyn CourierClient>,
    store: Arc<dyn OrderStore>,
    mapper: StatusMapper,
    gate: NotificationGate,
    guard: ProfitGuard,
    settings: ReconcilerSettings,
    syncing: AtomicBool,
    stats: Mutex<SyncStats>,
    /// Orders whose last write timed out and may have landed without a notification.
    unconfirmed_writes: Mutex<HashSet<String>>,
}

impl Reconciler {
    pub fn new(
        courier: Arc<dyn CourierClient>,
        store: Arc<dyn OrderStore>,
        sender: Arc<dyn NotificationSender>,
        policy: &SyncPolicy,
        store_timeout: Duration,
    ) -> Self {
        let mapper = StatusMapper::default().with_overrides(policy.status_overrides.clone());
        let gate = NotificationGate::new(
            Arc::clone(&store),
            sender,
            policy.notify_statuses.iter().copied(),
            policy.notification_cooldown(),
        )
        .with_terminal_bypass(policy.terminal_bypasses_cooldown);
        let guard = ProfitGuard::new(Arc::clone(&store), policy.profit_recheck_delay());
        Self {
            courier,
            store,
            mapper,
            gate,
            guard,
            settings: ReconcilerSettings::from_policy(policy, store_timeout),
            syncing: AtomicBool::new(false),
            stats: Mutex::new(SyncStats::default()),
            unconfirmed_writes: Mutex::new(HashSet::new()),
        }
    }

    pub fn courier_name(&self) -> &'static str {
        self.courier.name()
    }

    pub fn gate(&self) -> &NotificationGate {
        &self.gate
    }

    pub fn guard(&self) -> &ProfitGuard {
        &self.guard
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats.lock().clone();
        stats.currently_syncing = self.is_syncing();
        stats.profit_reverts = self.guard.reverts();
        stats
    }

    pub(crate) fn update_stats(&self, apply: impl FnOnce(&mut SyncStats)) {
        apply(&mut self.stats.lock());
    }

    /// Runs a single pass unless one is already in flight.
    pub async fn run_pass(&self) -> PassOutcome {
        let Some(_flag) = SyncingFlag::acquire(&self.syncing) else {
            debug!("reconciliation already in progress; trigger dropped");
            self.update_stats(|s| s.busy_skips += 1);
            return PassOutcome::Busy;
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile_pass", %run_id, courier = self.courier.name());
        let result = self.execute(run_id, started_at).instrument(span).await;
        let finished_at = Utc::now();

        let outcome = match result {
            Ok(mut report) => {
                report.finished_at = finished_at;
                info!(
                    %run_id,
                    remote = report.remote_orders,
                    matched = report.matched,
                    updated = report.updated,
                    skipped = report.skipped.total(),
                    ignored = report.ignored,
                    failed = report.failed_updates,
                    notified = report.notifications_sent,
                    handoffs = report.handoffs_submitted,
                    "reconciliation pass complete"
                );
                PassOutcome::Completed(report)
            }
            Err(PassFailure { stage, error }) => {
                error!(%run_id, %stage, %error, "reconciliation pass failed");
                PassOutcome::Failed { stage, error }
            }
        };

        self.update_stats(|s| {
            s.total_passes += 1;
            s.last_sync_time = Some(finished_at);
            match &outcome {
                PassOutcome::Completed(report) => {
                    s.successful_passes += 1;
                    s.orders_updated += report.updated as u64;
                    s.orders_skipped += report.skipped.total() as u64;
                    s.notifications_sent += report.notifications_sent as u64;
                    s.handoffs_submitted += report.handoffs_submitted as u64;
                    s.last_report = Some(report.clone());
                }
                PassOutcome::Failed { stage, error } => {
                    s.failed_passes += 1;
                    s.last_error = Some(format!("{stage}: {error}"));
                }
                PassOutcome::Busy => {}
            }
        });
        outcome
    }

    async fn execute(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<PassReport, PassFailure> {
        let mut report = PassReport::new(run_id, started_at);

        let remote = self
            .courier
            .fetch_all_merchant_orders()
            .await
            .map_err(|err| PassFailure::at(PassStage::FetchingRemote, err))?;
        let local = self
            .with_store_timeout("fetch_active_courier_orders", self.store.fetch_active_courier_orders())
            .await
            .map_err(|err| PassFailure::at(PassStage::FetchingLocal, err))?;
        report.remote_orders = remote.len();
        report.local_candidates = local.len();
        debug!(remote = remote.len(), local = local.len(), "fetched both sides");

        let index = index_local(&local);
        let mut handled: HashSet<usize> = HashSet::new();
        let mut rechecks: Vec<JoinHandle<bool>> = Vec::new();

        for remote_order in &remote {
            let Some(position) = lookup(&index, remote_order) else {
                report.unmatched += 1;
                continue;
            };
            report.matched += 1;
            if !handled.insert(position) {
                report.duplicates += 1;
                continue;
            }
            if self.settings.ignored_codes.contains(&remote_order.status_code) {
                report.ignored += 1;
                continue;
            }
            self.reconcile_one(&local[position], remote_order, &mut report, &mut rechecks)
                .await;
        }

        self.handoff_sweep(&mut report).await;

        for recheck in rechecks {
            match recheck.await {
                Ok(true) => report.profit_reverts += 1,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "delayed profit re-check did not finish"),
            }
        }
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        order: &Order,
        remote: &RemoteOrder,
        report: &mut PassReport,
        rechecks: &mut Vec<JoinHandle<bool>>,
    ) {
        let status = self.mapper.map(remote.status_code, &remote.status_text);
        let persisted_code = self.mapper.persisted_code(remote.status_code);
        let courier_text = remote.status_text.trim();
        let now = Utc::now();

        if let Decision::Skip(reason) = decide(
            order,
            status,
            persisted_code,
            courier_text,
            now,
            self.settings.min_update_interval,
        ) {
            debug!(order_id = %order.id, ?reason, %status, "skipping order");
            report.skipped.record(reason);
            if reason == SkipReason::Unchanged && self.unconfirmed_writes.lock().remove(&order.id) {
                debug!(order_id = %order.id, %status, "timed-out write had landed; notifying");
                if self.gate.maybe_notify(order, status, courier_text).await {
                    report.notifications_sent += 1;
                }
            }
            return;
        }

        let patch = StatusPatch {
            order_id: order.id.clone(),
            status,
            courier_status_code: persisted_code,
            courier_status_text: courier_text.to_string(),
            courier_order_id: order.courier_order_id.is_none().then(|| remote.id.clone()),
            courier_tracking_id: if order.courier_tracking_id.is_none() {
                remote.tracking_id.clone()
            } else {
                None
            },
            updated_at: now,
        };

        let result = self.apply(order, &patch, report, rechecks).await;
        if !matches!(result, Err(StoreError::Timeout { .. })) {
            self.unconfirmed_writes.lock().remove(&order.id);
        }
        match result {
            Ok(true) => {
                report.updated += 1;
                info!(order_id = %order.id, from = %order.status, to = %status, code = remote.status_code, "order status updated");
                if self.gate.maybe_notify(order, status, courier_text).await {
                    report.notifications_sent += 1;
                }
            }
            Ok(false) => {
                debug!(order_id = %order.id, "order became terminal before the write");
                report.skipped.record(SkipReason::BecameTerminal);
            }
            Err(err @ StoreError::Timeout { .. }) => {
                warn!(order_id = %order.id, error = %err, "status update timed out; outcome unknown");
                self.unconfirmed_writes.lock().insert(order.id.clone());
                report.failed_updates += 1;
            }
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "status update failed");
                report.failed_updates += 1;
            }
        }
    }

    async fn apply(
        &self,
        order: &Order,
        patch: &StatusPatch,
        report: &mut PassReport,
        rechecks: &mut Vec<JoinHandle<bool>>,
    ) -> Result<bool, StoreError> {
        if patch.status == CanonicalStatus::InDelivery && self.settings.profit_guard_enabled {
            let guarded = self
                .with_store_timeout("guarded_update", self.guard.guarded_update(patch, order.contact_key()))
                .await?;
            if guarded.reverted {
                warn!(order_id = %order.id, "profit interference reverted");
                report.profit_reverts += 1;
            }
            rechecks.extend(guarded.delayed_check);
            return Ok(guarded.applied);
        }
        self.with_store_timeout("update_status", self.store.update_status(patch))
            .await
    }

    async fn handoff_sweep(&self, report: &mut PassReport) {
        if self.settings.handoff_batch_size == 0 {
            return;
        }
        let pending = match self
            .with_store_timeout(
                "fetch_pending_handoff",
                self.store.fetch_pending_handoff(self.settings.handoff_batch_size),
            )
            .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!(stage = %PassStage::HandingOff, error = %err, "could not load orders awaiting hand-off");
                return;
            }
        };

        for order in pending {
            report.handoffs_attempted += 1;
            let Some(details) = order.delivery.clone() else {
                warn!(order_id = %order.id, "order has no delivery details; cannot hand off");
                report.handoffs_failed += 1;
                continue;
            };

            let receipt = match self.courier.create_order(&NewCourierOrder::for_order(&order, details)).await {
                Ok(receipt) => receipt,
                Err(err) => {
                    warn!(order_id = %order.id, error = %err, "courier rejected hand-off");
                    report.handoffs_failed += 1;
                    continue;
                }
            };

            match self
                .with_store_timeout("attach_courier", self.store.attach_courier(&order.id, &receipt))
                .await
            {
                Ok(true) => {
                    info!(order_id = %order.id, courier_order_id = %receipt.courier_order_id, "order handed to courier");
                    report.handoffs_submitted += 1;
                }
                Ok(false) => {
                    warn!(order_id = %order.id, courier_order_id = %receipt.courier_order_id, "order already carried a courier reference");
                    report.handoffs_failed += 1;
                }
                Err(err) => {
                    error!(
                        order_id = %order.id,
                        courier_order_id = %receipt.courier_order_id,
                        error = %err,
                        "courier order created but not recorded locally"
                    );
                    report.handoffs_failed += 1;
                }
            }
        }
    }

    async fn with_store_timeout<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.settings.store_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout { operation })?
    }
}

fn index_local(orders: &[Order]) -> HashMap<&str, usize> {
    let mut index = HashMap::with_capacity(orders.len() * 2);
    for (position, order) in orders.iter().enumerate() {
        if let Some(id) = order.courier_order_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            index.insert(id, position);
        }
    }
    for (position, order) in orders.iter().enumerate() {
        if let Some(id) = order.courier_tracking_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            index.entry(id).or_insert(position);
        }
    }
    index
}

fn lookup(index: &HashMap<&str, usize>, remote: &RemoteOrder) -> Option<usize> {
    index
        .get(remote.id.trim())
        .or_else(|| remote.tracking_id.as_deref().and_then(|t| index.get(t.trim())))
        .copied()
}
