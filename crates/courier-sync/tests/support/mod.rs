#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use courier_adapters::{CourierClient, CourierError};
use courier_core::{CanonicalStatus, CourierReceipt, DeliveryDetails, NewCourierOrder, Order, RemoteOrder};
use courier_storage::MemoryOrderStore;
use courier_sync::{
    NotificationMessage, NotificationSender, NotifyError, Reconciler, SendReceipt, SyncPolicy,
};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Courier double that serves a fixed listing and records hand-offs.
#[derive(Default)]
pub struct ScriptedCourier {
    pub remote: Mutex<Vec<RemoteOrder>>,
    pub fail_listing: AtomicBool,
    pub created: Mutex<Vec<NewCourierOrder>>,
    pub hold_listing: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedCourier {
    pub fn with_remote(remote: Vec<RemoteOrder>) -> Arc<Self> {
        let courier = Self::default();
        *courier.remote.lock() = remote;
        Arc::new(courier)
    }

    pub fn set_remote(&self, remote: Vec<RemoteOrder>) {
        *self.remote.lock() = remote;
    }
}

#[async_trait]
impl CourierClient for ScriptedCourier {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_all_merchant_orders(&self) -> Result<Vec<RemoteOrder>, CourierError> {
        if self.hold_listing.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(CourierError::Provider {
                code: "500".into(),
                message: "listing unavailable".into(),
            });
        }
        Ok(self.remote.lock().clone())
    }

    async fn fetch_orders_by_ids(&self, ids: &[String]) -> Result<Vec<RemoteOrder>, CourierError> {
        Ok(self
            .remote
            .lock()
            .iter()
            .filter(|r| ids.contains(&r.id))
            .cloned()
            .collect())
    }

    async fn create_order(&self, order: &NewCourierOrder) -> Result<CourierReceipt, CourierError> {
        self.created.lock().push(order.clone());
        Ok(CourierReceipt {
            courier_order_id: format!("H-{}", order.local_order_id),
            tracking_link: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<NotificationMessage>>,
}

impl RecordingSender {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, message: &NotificationMessage) -> Result<SendReceipt, NotifyError> {
        self.sent.lock().push(message.clone());
        Ok(SendReceipt {
            success: true,
            message_id: None,
            error: None,
        })
    }
}

pub fn policy() -> SyncPolicy {
    SyncPolicy {
        profit_recheck_delay_ms: 20,
        ..SyncPolicy::default()
    }
}

pub fn reconciler(
    courier: Arc<ScriptedCourier>,
    store: Arc<MemoryOrderStore>,
    sender: Arc<RecordingSender>,
    policy: &SyncPolicy,
) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(courier, store, sender, policy, Duration::from_secs(5)))
}

pub fn remote(id: &str, code: i64, text: &str) -> RemoteOrder {
    RemoteOrder {
        id: id.into(),
        tracking_id: Some(id.into()),
        status_code: code,
        status_text: text.into(),
        tracking_link: None,
    }
}

/// A dispatched order last touched a day ago.
pub fn local(id: &str, courier_id: Option<&str>, tracking_id: &str, status: CanonicalStatus) -> Order {
    let mut order = Order::new(id, status);
    order.courier_order_id = courier_id.map(str::to_string);
    order.courier_tracking_id = Some(tracking_id.into());
    order.user_phone = Some(format!("0770{id}"));
    order.status_updated_at = Some(Utc::now() - chrono::Duration::days(1));
    order
}

pub fn details() -> DeliveryDetails {
    DeliveryDetails {
        customer_name: "Ali".into(),
        customer_phone: "07801112222".into(),
        city_id: "1".into(),
        region_id: "3".into(),
        address: "Mansour".into(),
        total_price: 30000.0,
        items_count: 1,
    }
}
