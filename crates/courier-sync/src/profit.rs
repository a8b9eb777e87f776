//! Keeps a user's profit figures stable across a status write.
//!
//! External listeners on the orders table may recompute profits when a status
//! changes. The guard snapshots the figures, performs the write, and restores
//! the snapshot if they moved, once immediately and once after a delay. This is
//! a mitigation only: a listener that fires later than the delayed check still
//! wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{ProfitSnapshot, StatusPatch};
use courier_storage::{OrderStore, StoreError};
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[derive(Debug)]
pub struct GuardReport {
    /// The status row was written.
    pub applied: bool,
    /// The immediate re-check found interference and restored the snapshot.
    pub reverted: bool,
    /// Resolves to whether the delayed re-check restored the snapshot.
    pub delayed_check: Option<JoinHandle<bool>>,
}

impl GuardReport {
    fn unguarded(applied: bool) -> Self {
        Self {
            applied,
            reverted: false,
            delayed_check: None,
        }
    }
}

#[derive(Clone)]
pub struct ProfitGuard {
    store: Arc<dyn OrderStore>,
    recheck_delay: Duration,
    reverts: Arc<AtomicU64>,
}

impl ProfitGuard {
    pub fn new(store: Arc<dyn OrderStore>, recheck_delay: Duration) -> Self {
        Self {
            store,
            recheck_delay,
            reverts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total restores performed by this guard, including delayed ones.
    pub fn reverts(&self) -> u64 {
        self.reverts.load(Ordering::Relaxed)
    }

    pub async fn guarded_update(
        &self,
        patch: &StatusPatch,
        user_phone: Option<&str>,
    ) -> Result<GuardReport, StoreError> {
        let Some(phone) = user_phone.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(GuardReport::unguarded(self.store.update_status(patch).await?));
        };

        let snapshot = match self.store.read_profit(phone).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(order_id = %patch.order_id, error = %err, "profit snapshot unavailable; updating unguarded");
                None
            }
        };

        let applied = self.store.update_status(patch).await?;
        let Some(snapshot) = snapshot.filter(|_| applied) else {
            return Ok(GuardReport::unguarded(applied));
        };

        let reverted = restore_if_changed(self.store.as_ref(), phone, &snapshot, &self.reverts, "immediate").await;

        let store = Arc::clone(&self.store);
        let reverts = Arc::clone(&self.reverts);
        let delay = self.recheck_delay;
        let phone = phone.to_string();
        let delayed_check = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            restore_if_changed(store.as_ref(), &phone, &snapshot, &reverts, "delayed").await
        });

        Ok(GuardReport {
            applied,
            reverted,
            delayed_check: Some(delayed_check),
        })
    }
}

async fn restore_if_changed(
    store: &dyn OrderStore,
    phone: &str,
    snapshot: &ProfitSnapshot,
    reverts: &AtomicU64,
    check: &'static str,
) -> bool {
    let current = match store.read_profit(phone).await {
        Ok(Some(current)) => current,
        Ok(None) => return false,
        Err(err) => {
            warn!(check, error = %err, "profit re-check failed");
            return false;
        }
    };
    if current == *snapshot {
        return false;
    }

    warn!(
        check,
        before_achieved = snapshot.achieved_profit,
        before_expected = snapshot.expected_profit,
        after_achieved = current.achieved_profit,
        after_expected = current.expected_profit,
        "profit changed during status update; restoring snapshot"
    );
    match store.write_profit(phone, snapshot).await {
        Ok(()) => {
            reverts.fetch_add(1, Ordering::Relaxed);
            true
        }
        Err(err) => {
            error!(check, error = %err, "failed to restore profit snapshot");
            false
        }
    }
}
