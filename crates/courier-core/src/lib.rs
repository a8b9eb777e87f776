//! Core order model and canonical status vocabulary for courier reconciliation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "courier-core";

/// Application-level order status, independent of the courier's own codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    Active,
    InDelivery,
    Delivered,
    Cancelled,
    Rejected,
    Returned,
    ReturnedToMerchant,
    NoAnswer,
    PhoneClosed,
    NumberUnreachable,
    Postponed,
    WrongAddress,
    AddressChanged,
    DuplicateOrder,
    NotOrdered,
    OutOfService,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusFamily {
    PreDispatch,
    InTransit,
    Exception,
    Delivered,
    Closed,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 16] = [
        CanonicalStatus::Active,
        CanonicalStatus::InDelivery,
        CanonicalStatus::Delivered,
        CanonicalStatus::Cancelled,
        CanonicalStatus::Rejected,
        CanonicalStatus::Returned,
        CanonicalStatus::ReturnedToMerchant,
        CanonicalStatus::NoAnswer,
        CanonicalStatus::PhoneClosed,
        CanonicalStatus::NumberUnreachable,
        CanonicalStatus::Postponed,
        CanonicalStatus::WrongAddress,
        CanonicalStatus::AddressChanged,
        CanonicalStatus::DuplicateOrder,
        CanonicalStatus::NotOrdered,
        CanonicalStatus::OutOfService,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::Active => "active",
            CanonicalStatus::InDelivery => "in_delivery",
            CanonicalStatus::Delivered => "delivered",
            CanonicalStatus::Cancelled => "cancelled",
            CanonicalStatus::Rejected => "rejected",
            CanonicalStatus::Returned => "returned",
            CanonicalStatus::ReturnedToMerchant => "returned_to_merchant",
            CanonicalStatus::NoAnswer => "no_answer",
            CanonicalStatus::PhoneClosed => "phone_closed",
            CanonicalStatus::NumberUnreachable => "number_unreachable",
            CanonicalStatus::Postponed => "postponed",
            CanonicalStatus::WrongAddress => "wrong_address",
            CanonicalStatus::AddressChanged => "address_changed",
            CanonicalStatus::DuplicateOrder => "duplicate_order",
            CanonicalStatus::NotOrdered => "not_ordered",
            CanonicalStatus::OutOfService => "out_of_service",
        }
    }

    pub fn family(self) -> StatusFamily {
        match self {
            CanonicalStatus::Active => StatusFamily::PreDispatch,
            CanonicalStatus::InDelivery | CanonicalStatus::AddressChanged => StatusFamily::InTransit,
            CanonicalStatus::NoAnswer
            | CanonicalStatus::PhoneClosed
            | CanonicalStatus::NumberUnreachable
            | CanonicalStatus::Postponed
            | CanonicalStatus::WrongAddress => StatusFamily::Exception,
            CanonicalStatus::Delivered => StatusFamily::Delivered,
            CanonicalStatus::Cancelled
            | CanonicalStatus::Rejected
            | CanonicalStatus::Returned
            | CanonicalStatus::ReturnedToMerchant
            | CanonicalStatus::DuplicateOrder
            | CanonicalStatus::NotOrdered
            | CanonicalStatus::OutOfService => StatusFamily::Closed,
        }
    }

    /// Terminal orders are never reconciled again.
    pub fn is_terminal(self) -> bool {
        matches!(self.family(), StatusFamily::Delivered | StatusFamily::Closed)
    }

    pub fn is_pre_dispatch(self) -> bool {
        self.family() == StatusFamily::PreDispatch
    }

    pub fn terminal_statuses() -> Vec<CanonicalStatus> {
        Self::ALL.into_iter().filter(|s| s.is_terminal()).collect()
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown canonical status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for CanonicalStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Customer and parcel details needed to hand an order to the courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryDetails {
    pub customer_name: String,
    pub customer_phone: String,
    pub city_id: String,
    pub region_id: String,
    pub address: String,
    pub total_price: f64,
    pub items_count: u32,
}

/// Locally persisted order, limited to the fields reconciliation reads or patches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub courier_order_id: Option<String>,
    pub courier_tracking_id: Option<String>,
    pub status: CanonicalStatus,
    pub courier_status_code: Option<i64>,
    pub courier_status_text: Option<String>,
    pub status_updated_at: Option<DateTime<Utc>>,
    pub last_status_check_at: Option<DateTime<Utc>>,
    pub user_phone: Option<String>,
    pub last_notification_status: Option<CanonicalStatus>,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub delivery: Option<DeliveryDetails>,
}

impl Order {
    pub fn new(id: impl Into<String>, status: CanonicalStatus) -> Self {
        Self {
            id: id.into(),
            courier_order_id: None,
            courier_tracking_id: None,
            status,
            courier_status_code: None,
            courier_status_text: None,
            status_updated_at: None,
            last_status_check_at: None,
            user_phone: None,
            last_notification_status: None,
            last_notified_at: None,
            delivery: None,
        }
    }

    /// Either courier reference means the order was handed over.
    pub fn is_dispatched(&self) -> bool {
        non_empty(self.courier_order_id.as_deref()) || non_empty(self.courier_tracking_id.as_deref())
    }

    pub fn contact_key(&self) -> Option<&str> {
        self.user_phone.as_deref().map(str::trim).filter(|p| !p.is_empty())
    }
}

fn non_empty(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}

/// One order as reported by the courier's merchant listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub id: String,
    pub tracking_id: Option<String>,
    pub status_code: i64,
    pub status_text: String,
    pub tracking_link: Option<String>,
}

/// Payload for submitting a new order to the courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCourierOrder {
    pub local_order_id: String,
    pub details: DeliveryDetails,
    pub package_size: String,
    pub merchant_notes: Option<String>,
}

impl NewCourierOrder {
    pub fn for_order(order: &Order, details: DeliveryDetails) -> Self {
        Self {
            local_order_id: order.id.clone(),
            details,
            package_size: "1".to_string(),
            merchant_notes: None,
        }
    }
}

/// Courier acknowledgement for a submitted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourierReceipt {
    pub courier_order_id: String,
    pub tracking_link: Option<String>,
}

/// Single-row status write produced by a reconciliation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPatch {
    pub order_id: String,
    pub status: CanonicalStatus,
    pub courier_status_code: Option<i64>,
    pub courier_status_text: String,
    pub courier_order_id: Option<String>,
    pub courier_tracking_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitSnapshot {
    pub achieved_profit: f64,
    pub expected_profit: f64,
}
