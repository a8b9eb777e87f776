//! In-process order store with the same conditional-write semantics as Postgres.
//!
//! Used for dry runs and as the store behind reconciliation tests; failure
//! injection and an update hook let callers simulate a misbehaving backend or
//! an unrelated listener reacting to order writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{CanonicalStatus, CourierReceipt, Order, ProfitSnapshot, StatusPatch};
use parking_lot::Mutex;

use crate::{OrderStore, StoreError};

type UpdateHook = Arc<dyn Fn(&StatusPatch, &mut HashMap<String, ProfitSnapshot>) + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    orders: BTreeMap<String, Order>,
    profits: HashMap<String, ProfitSnapshot>,
    failing_updates: HashSet<String>,
    fail_fetches: bool,
    missing_notification_columns: bool,
    update_ack_delay: Option<Duration>,
    update_calls: usize,
    profit_writes: usize,
}

#[derive(Default)]
pub struct MemoryOrderStore {
    state: Mutex<MemoryState>,
    on_update: Mutex<Option<UpdateHook>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: impl IntoIterator<Item = Order>) -> Self {
        let store = Self::new();
        for order in orders {
            store.insert_order(order);
        }
        store
    }

    pub fn insert_order(&self, order: Order) {
        self.state.lock().orders.insert(order.id.clone(), order);
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.state.lock().orders.get(id).cloned()
    }

    pub fn set_profit(&self, user_phone: &str, snapshot: ProfitSnapshot) {
        self.state.lock().profits.insert(user_phone.to_string(), snapshot);
    }

    pub fn profit(&self, user_phone: &str) -> Option<ProfitSnapshot> {
        self.state.lock().profits.get(user_phone).copied()
    }

    /// Makes every status write for `order_id` fail until cleared.
    pub fn fail_updates_for(&self, order_id: &str) {
        self.state.lock().failing_updates.insert(order_id.to_string());
    }

    pub fn clear_update_failures(&self) {
        self.state.lock().failing_updates.clear();
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.state.lock().fail_fetches = fail;
    }

    /// Simulates a schema without the notification bookkeeping columns.
    pub fn drop_notification_columns(&self) {
        self.state.lock().missing_notification_columns = true;
    }

    /// Holds back the reply to every status write after the row has changed,
    /// like a backend that commits and then answers slowly.
    pub fn delay_update_acks(&self, delay: Option<Duration>) {
        self.state.lock().update_ack_delay = delay;
    }

    /// Registers a listener invoked after every successful status write.
    pub fn on_status_update<F>(&self, hook: F)
    where
        F: Fn(&StatusPatch, &mut HashMap<String, ProfitSnapshot>) + Send + Sync + 'static,
    {
        *self.on_update.lock() = Some(Arc::new(hook));
    }

    pub fn update_calls(&self) -> usize {
        self.state.lock().update_calls
    }

    pub fn profit_writes(&self) -> usize {
        self.state.lock().profit_writes
    }

    fn write_status(&self, patch: &StatusPatch) -> Result<bool, StoreError> {
        let hook = self.on_update.lock().clone();
        let mut state = self.state.lock();
        state.update_calls += 1;
        if state.failing_updates.contains(&patch.order_id) {
            return Err(StoreError::Unavailable(format!(
                "write rejected for order {}",
                patch.order_id
            )));
        }

        let Some(order) = state.orders.get_mut(&patch.order_id) else {
            return Ok(false);
        };
        if order.status.is_terminal() {
            return Ok(false);
        }

        order.status = patch.status;
        order.courier_status_code = patch.courier_status_code;
        order.courier_status_text = Some(patch.courier_status_text.clone());
        order.status_updated_at = Some(patch.updated_at);
        order.last_status_check_at = Some(patch.updated_at);
        if order.courier_order_id.is_none() {
            order.courier_order_id = patch.courier_order_id.clone();
        }
        if order.courier_tracking_id.is_none() {
            order.courier_tracking_id = patch.courier_tracking_id.clone();
        }

        if let Some(hook) = hook {
            hook(patch, &mut state.profits);
        }
        Ok(true)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn fetch_active_courier_orders(&self) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock();
        if state.fail_fetches {
            return Err(StoreError::Unavailable("order fetch disabled".into()));
        }
        Ok(state
            .orders
            .values()
            .filter(|o| o.is_dispatched() && !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn fetch_pending_handoff(&self, limit: usize) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock();
        if state.fail_fetches {
            return Err(StoreError::Unavailable("order fetch disabled".into()));
        }
        Ok(state
            .orders
            .values()
            .filter(|o| o.status == CanonicalStatus::InDelivery && !o.is_dispatched())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status(&self, patch: &StatusPatch) -> Result<bool, StoreError> {
        let ack_delay = self.state.lock().update_ack_delay;
        let applied = self.write_status(patch)?;
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(applied)
    }

    async fn attach_courier(&self, order_id: &str, receipt: &CourierReceipt) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let Some(order) = state.orders.get_mut(order_id) else {
            return Ok(false);
        };
        if order.courier_order_id.is_some() {
            return Ok(false);
        }
        order.courier_order_id = Some(receipt.courier_order_id.clone());
        if order.courier_tracking_id.is_none() {
            order.courier_tracking_id = Some(receipt.courier_order_id.clone());
        }
        Ok(true)
    }

    async fn record_notification(
        &self,
        order_id: &str,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.missing_notification_columns {
            return Err(StoreError::MissingColumn {
                column: "last_notification_status".into(),
            });
        }
        if let Some(order) = state.orders.get_mut(order_id) {
            order.last_notification_status = Some(status);
            order.last_notified_at = Some(at);
        }
        Ok(())
    }

    async fn read_profit(&self, user_phone: &str) -> Result<Option<ProfitSnapshot>, StoreError> {
        Ok(self.state.lock().profits.get(user_phone).copied())
    }

    async fn write_profit(&self, user_phone: &str, snapshot: &ProfitSnapshot) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.profit_writes += 1;
        match state.profits.get_mut(user_phone) {
            Some(current) => {
                *current = *snapshot;
                Ok(())
            }
            None => Err(StoreError::UserNotFound(user_phone.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dispatched(id: &str, status: CanonicalStatus) -> Order {
        let mut order = Order::new(id, status);
        order.courier_tracking_id = Some(format!("QR-{id}"));
        order
    }

    fn patch(order_id: &str, status: CanonicalStatus) -> StatusPatch {
        StatusPatch {
            order_id: order_id.into(),
            status,
            courier_status_code: Some(4),
            courier_status_text: "delivered".into(),
            courier_order_id: Some("C-1".into()),
            courier_tracking_id: None,
            updated_at: Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn terminal_orders_are_not_candidates_or_writable() {
        let store = MemoryOrderStore::with_orders([
            dispatched("a", CanonicalStatus::InDelivery),
            dispatched("b", CanonicalStatus::Delivered),
            Order::new("c", CanonicalStatus::Active),
        ]);

        let active = store.fetch_active_courier_orders().await.unwrap();
        assert_eq!(active.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["a"]);

        assert!(!store.update_status(&patch("b", CanonicalStatus::Cancelled)).await.unwrap());
        assert_eq!(store.order("b").unwrap().status, CanonicalStatus::Delivered);
    }

    #[tokio::test]
    async fn update_fills_missing_courier_reference_only() {
        let store = MemoryOrderStore::with_orders([dispatched("a", CanonicalStatus::InDelivery)]);
        assert!(store.update_status(&patch("a", CanonicalStatus::Delivered)).await.unwrap());

        let order = store.order("a").unwrap();
        assert_eq!(order.courier_order_id.as_deref(), Some("C-1"));
        assert_eq!(order.courier_tracking_id.as_deref(), Some("QR-a"));
        assert_eq!(order.courier_status_code, Some(4));
    }

    #[tokio::test]
    async fn missing_notification_columns_report_schema_mismatch() {
        let store = MemoryOrderStore::with_orders([dispatched("a", CanonicalStatus::InDelivery)]);
        store.drop_notification_columns();
        let err = store
            .record_notification("a", CanonicalStatus::InDelivery, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { .. }));
    }
}
