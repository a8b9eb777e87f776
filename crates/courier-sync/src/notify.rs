//! User notifications: the sender port and the deduplicating gate in front of it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{CanonicalStatus, Order};
use courier_storage::{FetchError, HttpFetcher, Idempotency, OrderStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub user_key: String,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub success: bool,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, message: &NotificationMessage) -> Result<SendReceipt, NotifyError>;
}

/// Posts messages as JSON to a push relay.
pub struct WebhookSender {
    http: HttpFetcher,
    url: String,
}

impl WebhookSender {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self { http, url: url.into() }
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, message: &NotificationMessage) -> Result<SendReceipt, NotifyError> {
        let receipt: SendReceipt = self
            .http
            .post_json(&self.url, message, Idempotency::SingleShot)
            .await?;
        if !receipt.success {
            return Err(NotifyError::Rejected(
                receipt.error.unwrap_or_else(|| "push relay reported failure".to_string()),
            ));
        }
        Ok(receipt)
    }
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, message: &NotificationMessage) -> Result<SendReceipt, NotifyError> {
        info!(user = %message.user_key, title = %message.title, body = %message.body, "notification (log only)");
        Ok(SendReceipt {
            success: true,
            message_id: None,
            error: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationMemoryEntry {
    pub last_notified_status: CanonicalStatus,
    pub last_notified_at: DateTime<Utc>,
}

/// Why the gate held a notification back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRefusal {
    NoContact,
    NotNotifiable,
    SameStatus,
    Cooldown,
}

/// Decides whether a status transition reaches the user, at most once per
/// status and at most once per cooldown window.
pub struct NotificationGate {
    store: Arc<dyn OrderStore>,
    sender: Arc<dyn NotificationSender>,
    notify_statuses: HashSet<CanonicalStatus>,
    cooldown: chrono::Duration,
    terminal_bypasses_cooldown: bool,
    memory: Mutex<HashMap<String, NotificationMemoryEntry>>,
    durable_writes: AtomicBool,
}

impl NotificationGate {
    pub fn new(
        store: Arc<dyn OrderStore>,
        sender: Arc<dyn NotificationSender>,
        notify_statuses: impl IntoIterator<Item = CanonicalStatus>,
        cooldown: chrono::Duration,
    ) -> Self {
        Self {
            store,
            sender,
            notify_statuses: notify_statuses.into_iter().collect(),
            cooldown,
            terminal_bypasses_cooldown: false,
            memory: Mutex::new(HashMap::new()),
            durable_writes: AtomicBool::new(true),
        }
    }

    /// Lets transitions into a terminal status through an open cooldown window.
    pub fn with_terminal_bypass(mut self, enabled: bool) -> Self {
        self.terminal_bypasses_cooldown = enabled;
        self
    }

    pub async fn maybe_notify(&self, order: &Order, status: CanonicalStatus, courier_text: &str) -> bool {
        self.maybe_notify_at(order, status, courier_text, Utc::now()).await
    }

    pub async fn maybe_notify_at(
        &self,
        order: &Order,
        status: CanonicalStatus,
        courier_text: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let user_key = match self.check(order, status, now) {
            Ok(key) => key,
            Err(refusal) => {
                debug!(order_id = %order.id, %status, ?refusal, "notification held back");
                return false;
            }
        };

        let message = compose_message(order, &user_key, status, courier_text);
        match self.sender.send(&message).await {
            Ok(receipt) => {
                debug!(order_id = %order.id, %status, message_id = ?receipt.message_id, "notification sent");
            }
            Err(err) => {
                warn!(order_id = %order.id, %status, error = %err, "notification send failed");
                return false;
            }
        }

        self.memory.lock().insert(
            order.id.clone(),
            NotificationMemoryEntry {
                last_notified_status: status,
                last_notified_at: now,
            },
        );
        self.record_durably(&order.id, status, now).await;
        true
    }

    /// Applies every refusal rule without side effects.
    pub fn check(&self, order: &Order, status: CanonicalStatus, now: DateTime<Utc>) -> Result<String, GateRefusal> {
        let user_key = order.contact_key().ok_or(GateRefusal::NoContact)?.to_string();
        if !self.notify_statuses.contains(&status) {
            return Err(GateRefusal::NotNotifiable);
        }

        let remembered = self.memory_entry(&order.id);
        let durable = order
            .last_notification_status
            .map(|s| (s, order.last_notified_at));
        let sources = [
            remembered.map(|e| (e.last_notified_status, Some(e.last_notified_at))),
            durable,
        ];

        for (last_status, last_at) in sources.into_iter().flatten() {
            if last_status == status {
                return Err(GateRefusal::SameStatus);
            }
            if last_at.is_some_and(|at| self.cooling_down(status, at, now)) {
                return Err(GateRefusal::Cooldown);
            }
        }
        if let (None, Some(at)) = (order.last_notification_status, order.last_notified_at) {
            if self.cooling_down(status, at, now) {
                return Err(GateRefusal::Cooldown);
            }
        }
        Ok(user_key)
    }

    fn cooling_down(&self, status: CanonicalStatus, last_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if self.terminal_bypasses_cooldown && status.is_terminal() {
            return false;
        }
        now - last_at < self.cooldown
    }

    pub fn memory_entry(&self, order_id: &str) -> Option<NotificationMemoryEntry> {
        self.memory.lock().get(order_id).copied()
    }

    pub fn durable_writes_enabled(&self) -> bool {
        self.durable_writes.load(Ordering::Relaxed)
    }

    async fn record_durably(&self, order_id: &str, status: CanonicalStatus, at: DateTime<Utc>) {
        if !self.durable_writes_enabled() {
            return;
        }
        match self.store.record_notification(order_id, status, at).await {
            Ok(()) => {}
            Err(StoreError::MissingColumn { column }) => {
                if self.durable_writes.swap(false, Ordering::Relaxed) {
                    warn!(%column, "notification columns missing; keeping notification history in memory only");
                }
            }
            Err(err) => {
                warn!(%order_id, error = %err, "could not persist notification bookkeeping");
            }
        }
    }
}

pub fn compose_message(
    order: &Order,
    user_key: &str,
    status: CanonicalStatus,
    courier_text: &str,
) -> NotificationMessage {
    NotificationMessage {
        user_key: user_key.to_string(),
        title: "Order update".to_string(),
        body: format!("Order {}: {}", order.id, describe(status)),
        data: json!({
            "order_id": order.id,
            "status": status,
            "courier_status_text": courier_text,
            "courier_order_id": order.courier_order_id,
        }),
    }
}

fn describe(status: CanonicalStatus) -> &'static str {
    match status {
        CanonicalStatus::Active => "your order is confirmed",
        CanonicalStatus::InDelivery => "your order is on its way",
        CanonicalStatus::Delivered => "your order was delivered",
        CanonicalStatus::Cancelled => "your order was cancelled",
        CanonicalStatus::Rejected => "your order was rejected",
        CanonicalStatus::Returned | CanonicalStatus::ReturnedToMerchant => "your order was returned",
        CanonicalStatus::NoAnswer => "the courier could not reach the customer",
        CanonicalStatus::PhoneClosed => "the customer phone is switched off",
        CanonicalStatus::NumberUnreachable => "the customer number is unreachable",
        CanonicalStatus::Postponed => "delivery was postponed",
        CanonicalStatus::WrongAddress => "the delivery address needs correcting",
        CanonicalStatus::AddressChanged => "the delivery address was changed",
        CanonicalStatus::DuplicateOrder => "the order was closed as a duplicate",
        CanonicalStatus::NotOrdered => "the customer says they did not order",
        CanonicalStatus::OutOfService => "the destination is outside the service area",
    }
}
