//! Postgres-backed order store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{CanonicalStatus, CourierReceipt, DeliveryDetails, Order, ProfitSnapshot, StatusPatch};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::warn;

use crate::{OrderStore, StoreError};

const UNDEFINED_COLUMN: &str = "42703";

const BASE_COLUMNS: &str = "id::text AS id, courier_order_id, courier_qr_id, status, \
     courier_status_id::int8 AS courier_status_id, courier_status_text, status_updated_at, \
     last_status_check_at, user_phone, customer_name, customer_phone, city_id::text AS city_id, \
     region_id::text AS region_id, address, total_amount::float8 AS total_amount, \
     items_count::int8 AS items_count";

const NOTIFICATION_COLUMNS: &str = "last_notification_status, last_notified_at";

#[derive(Debug)]
pub struct PgOrderStore {
    pool: PgPool,
    notification_columns: AtomicBool,
}

impl PgOrderStore {
    pub async fn connect(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .context("connecting to order store")?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            notification_columns: AtomicBool::new(true),
        }
    }

    pub fn notification_columns_enabled(&self) -> bool {
        self.notification_columns.load(Ordering::Relaxed)
    }

    fn disable_notification_columns(&self, err: &sqlx::Error) {
        if self.notification_columns.swap(false, Ordering::Relaxed) {
            warn!(error = %err, "orders table lacks notification bookkeeping columns; continuing without them");
        }
    }

    fn select_list(with_notifications: bool) -> String {
        if with_notifications {
            format!("{BASE_COLUMNS}, {NOTIFICATION_COLUMNS}")
        } else {
            BASE_COLUMNS.to_string()
        }
    }

    async fn query_active(&self, with_notifications: bool) -> Result<Vec<PgRow>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {}
              FROM orders
             WHERE (courier_order_id IS NOT NULL OR courier_qr_id IS NOT NULL)
               AND status <> ALL($1)
             ORDER BY status_updated_at NULLS FIRST
            "#,
            Self::select_list(with_notifications)
        );
        sqlx::query(&sql)
            .bind(terminal_status_names())
            .fetch_all(&self.pool)
            .await
    }

    async fn query_pending_handoff(&self, with_notifications: bool, limit: i64) -> Result<Vec<PgRow>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {}
              FROM orders
             WHERE status = $1
               AND courier_order_id IS NULL
               AND courier_qr_id IS NULL
             ORDER BY status_updated_at NULLS FIRST
             LIMIT $2
            "#,
            Self::select_list(with_notifications)
        );
        sqlx::query(&sql)
            .bind(CanonicalStatus::InDelivery.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
    }

    fn rows_to_orders(rows: Vec<PgRow>, with_notifications: bool) -> Vec<Order> {
        rows.iter()
            .filter_map(|row| match order_from_row(row, with_notifications) {
                Ok(order) => Some(order),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable order row");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn fetch_active_courier_orders(&self) -> Result<Vec<Order>, StoreError> {
        let with_notifications = self.notification_columns_enabled();
        let rows = match self.query_active(with_notifications).await {
            Err(err) if with_notifications && is_undefined_column(&err) => {
                self.disable_notification_columns(&err);
                self.query_active(false).await?
            }
            other => other?,
        };
        Ok(Self::rows_to_orders(rows, self.notification_columns_enabled()))
    }

    async fn fetch_pending_handoff(&self, limit: usize) -> Result<Vec<Order>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let with_notifications = self.notification_columns_enabled();
        let rows = match self.query_pending_handoff(with_notifications, limit).await {
            Err(err) if with_notifications && is_undefined_column(&err) => {
                self.disable_notification_columns(&err);
                self.query_pending_handoff(false, limit).await?
            }
            other => other?,
        };
        Ok(Self::rows_to_orders(rows, self.notification_columns_enabled()))
    }

    async fn update_status(&self, patch: &StatusPatch) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
               SET status = $2,
                   courier_status_id = $3,
                   courier_status_text = $4,
                   status_updated_at = $5,
                   last_status_check_at = $5,
                   courier_order_id = COALESCE(courier_order_id, $6),
                   courier_qr_id = COALESCE(courier_qr_id, $7)
             WHERE id::text = $1
               AND status <> ALL($8)
            "#,
        )
        .bind(&patch.order_id)
        .bind(patch.status.as_str())
        .bind(patch.courier_status_code)
        .bind(&patch.courier_status_text)
        .bind(patch.updated_at)
        .bind(patch.courier_order_id.as_deref())
        .bind(patch.courier_tracking_id.as_deref())
        .bind(terminal_status_names())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn attach_courier(&self, order_id: &str, receipt: &CourierReceipt) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
               SET courier_order_id = $2,
                   courier_qr_id = COALESCE(courier_qr_id, $2),
                   courier_tracking_link = COALESCE($3, courier_tracking_link)
             WHERE id::text = $1
               AND courier_order_id IS NULL
            "#,
        )
        .bind(order_id)
        .bind(&receipt.courier_order_id)
        .bind(receipt.tracking_link.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_notification(
        &self,
        order_id: &str,
        status: CanonicalStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if !self.notification_columns_enabled() {
            return Err(StoreError::MissingColumn {
                column: "last_notification_status".to_string(),
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE orders
               SET last_notification_status = $2,
                   last_notified_at = $3
             WHERE id::text = $1
            "#,
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_undefined_column(&err) => {
                self.disable_notification_columns(&err);
                Err(StoreError::MissingColumn {
                    column: "last_notification_status".to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn read_profit(&self, user_phone: &str) -> Result<Option<ProfitSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(achieved_profits, 0)::float8 AS achieved_profits,
                   COALESCE(expected_profits, 0)::float8 AS expected_profits
              FROM users
             WHERE phone = $1
            "#,
        )
        .bind(user_phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<ProfitSnapshot, StoreError> {
            Ok(ProfitSnapshot {
                achieved_profit: row.try_get("achieved_profits")?,
                expected_profit: row.try_get("expected_profits")?,
            })
        })
        .transpose()
    }

    async fn write_profit(&self, user_phone: &str, snapshot: &ProfitSnapshot) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE users
               SET achieved_profits = $2,
                   expected_profits = $3
             WHERE phone = $1
            "#,
        )
        .bind(user_phone)
        .bind(snapshot.achieved_profit)
        .bind(snapshot.expected_profit)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_phone.to_string()));
        }
        Ok(())
    }
}

fn is_undefined_column(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(UNDEFINED_COLUMN),
        _ => false,
    }
}

fn terminal_status_names() -> Vec<String> {
    CanonicalStatus::terminal_statuses()
        .into_iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn order_from_row(row: &PgRow, with_notifications: bool) -> Result<Order, StoreError> {
    let id: String = row.try_get("id")?;
    let status_raw: String = row.try_get("status")?;
    let status = status_raw
        .parse::<CanonicalStatus>()
        .map_err(|err| StoreError::InvalidRow(format!("order {id}: {err}")))?;

    let (last_notification_status, last_notified_at) = if with_notifications {
        let raw: Option<String> = row.try_get("last_notification_status")?;
        let at: Option<DateTime<Utc>> = row.try_get("last_notified_at")?;
        (raw.and_then(|s| s.parse::<CanonicalStatus>().ok()), at)
    } else {
        (None, None)
    };

    Ok(Order {
        courier_order_id: row.try_get("courier_order_id")?,
        courier_tracking_id: row.try_get("courier_qr_id")?,
        status,
        courier_status_code: row.try_get("courier_status_id")?,
        courier_status_text: row.try_get("courier_status_text")?,
        status_updated_at: row.try_get("status_updated_at")?,
        last_status_check_at: row.try_get("last_status_check_at")?,
        user_phone: row.try_get("user_phone")?,
        last_notification_status,
        last_notified_at,
        delivery: delivery_from_row(row)?,
        id,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<Option<DeliveryDetails>, StoreError> {
    let customer_name: Option<String> = row.try_get("customer_name")?;
    let customer_phone: Option<String> = row.try_get("customer_phone")?;
    let city_id: Option<String> = row.try_get("city_id")?;
    let region_id: Option<String> = row.try_get("region_id")?;
    let address: Option<String> = row.try_get("address")?;
    let total_amount: Option<f64> = row.try_get("total_amount")?;
    let items_count: Option<i64> = row.try_get("items_count")?;

    let (Some(customer_name), Some(customer_phone), Some(city_id), Some(region_id)) =
        (customer_name, customer_phone, city_id, region_id)
    else {
        return Ok(None);
    };

    Ok(Some(DeliveryDetails {
        customer_name,
        customer_phone,
        city_id,
        region_id,
        address: address.unwrap_or_default(),
        total_price: total_amount.unwrap_or_default(),
        items_count: items_count
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(1),
    }))
}
