//! Order store access and HTTP transport utilities for courier reconciliation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{CanonicalStatus, CourierReceipt, Order, ProfitSnapshot, StatusPatch};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, Idempotency};
pub use memory::MemoryOrderStore;
pub use postgres::PgOrderStore;

pub const CRATE_NAME: &str = "courier-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The store schema lacks an optional column.
    #[error("column `{column}` does not exist in the order store")]
    MissingColumn { column: String },
    #[error("user `{0}` has no profit record")]
    UserNotFound(String),
    #[error("store row is invalid: {0}")]
    InvalidRow(String),
    #[error("store operation `{operation}` timed out")]
    Timeout { operation: &'static str },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Read/patch access to persisted orders and the companion user profit record.
///
/// Every write is scoped to a single row keyed by order id or user phone.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Orders that were handed to the courier and are not yet terminal.
    async fn fetch_active_courier_orders(&self) -> Result<Vec<Order>, StoreError>;

    /// `in_delivery` orders that still lack a courier order id.
    async fn fetch_pending_handoff(&self, limit: usize) -> Result<Vec<Order>, StoreError>;

    /// Applies the patch unless the stored status is already terminal.
    /// Returns `false` when no row was changed.
    async fn update_status(&self, patch: &StatusPatch) -> Result<bool, StoreError>;

    async fn attach_courier(&self, order_id: &str, receipt: &CourierReceipt) -> Result<bool, StoreError>;

    async fn record_notification(
        &self,
        order_id: &str,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn read_profit(&self, user_phone: &str) -> Result<Option<ProfitSnapshot>, StoreError>;

    async fn write_profit(&self, user_phone: &str, snapshot: &ProfitSnapshot) -> Result<(), StoreError>;
}
