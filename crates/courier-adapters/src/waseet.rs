//! Waseet merchant API adapter.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_core::{CourierReceipt, NewCourierOrder, RemoteOrder};
use courier_storage::{HttpClientConfig, HttpFetcher, Idempotency};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{CourierClient, CourierError, MAX_IDS_PER_BULK_CALL};

/// Envelope error number Waseet uses for an expired or invalid token.
const INVALID_TOKEN_ERR: &str = "21";

#[derive(Clone)]
pub struct WaseetConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub token_ttl: Duration,
    pub parcel_type_name: String,
    pub http: HttpClientConfig,
}

impl std::fmt::Debug for WaseetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaseetConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("parcel_type_name", &self.parcel_type_name)
            .field("http", &self.http)
            .finish()
    }
}

impl Default for WaseetConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.alwaseet-iq.net/v1/merchant".to_string(),
            username: String::new(),
            password: String::new(),
            token_ttl: Duration::from_secs(50 * 60),
            parcel_type_name: "general".to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: bool,
    #[serde(rename = "errNum", default)]
    err_num: Option<JsonValue>,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LooseId {
    Text(String),
    Number(i64),
}

impl LooseId {
    fn into_string(self) -> String {
        match self {
            LooseId::Text(s) => s.trim().to_string(),
            LooseId::Number(n) => n.to_string(),
        }
    }

    fn as_code(&self) -> Option<i64> {
        match self {
            LooseId::Text(s) => s.trim().parse().ok(),
            LooseId::Number(n) => Some(*n),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct WireOrder {
    id: LooseId,
    #[serde(default)]
    qr_id: Option<LooseId>,
    status_id: LooseId,
    #[serde(default)]
    status: String,
    #[serde(default)]
    qr_link: Option<String>,
}

impl TryFrom<WireOrder> for RemoteOrder {
    type Error = CourierError;

    fn try_from(wire: WireOrder) -> Result<Self, Self::Error> {
        let status_code = wire.status_id.as_code().ok_or_else(|| {
            CourierError::Malformed(format!("non-numeric status id {:?}", wire.status_id))
        })?;
        let id = wire.id.into_string();
        if id.is_empty() {
            return Err(CourierError::Malformed("order without id".into()));
        }
        Ok(RemoteOrder {
            id,
            tracking_id: wire.qr_id.map(LooseId::into_string).filter(|s| !s.is_empty()),
            status_code,
            status_text: wire.status.trim().to_string(),
            tracking_link: wire.qr_link,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CreatedOrder {
    qr_id: LooseId,
    #[serde(default)]
    qr_link: Option<String>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct WaseetClient {
    config: WaseetConfig,
    http: HttpFetcher,
    token: Mutex<Option<CachedToken>>,
}

impl WaseetClient {
    pub fn new(config: WaseetConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http.clone())?;
        Ok(Self {
            config,
            http,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Returns the cached token, logging in when it is missing or expired.
    pub async fn authenticate(&self) -> Result<String, CourierError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
            debug!("waseet token expired");
        }

        let token = self.login().await?;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at: Instant::now() + self.config.token_ttl,
        });
        Ok(token)
    }

    pub async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn login(&self) -> Result<String, CourierError> {
        if self.config.username.is_empty() {
            return Err(CourierError::Auth("merchant username is not configured".into()));
        }
        let form = [
            ("username", self.config.username.clone()),
            ("password", self.config.password.clone()),
        ];
        let envelope: Envelope<LoginData> = self
            .http
            .post_form(&self.url("login"), &[], &form, Idempotency::Idempotent)
            .await
            .map_err(|err| match CourierError::from(err) {
                CourierError::Unauthorized(msg) => CourierError::Auth(msg),
                other => other,
            })?;

        let data = open_envelope(envelope).map_err(|err| match err {
            CourierError::Unauthorized(msg) | CourierError::Provider { message: msg, .. } => {
                CourierError::Auth(msg)
            }
            other => other,
        })?;
        info!("authenticated with waseet");
        Ok(data.token)
    }

    /// Runs `call` with a valid token; a rejected credential triggers one re-login.
    async fn with_token<T, F, Fut>(&self, call: F) -> Result<T, CourierError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CourierError>>,
    {
        let token = self.authenticate().await?;
        match call(token).await {
            Err(err) if err.is_unauthorized() => {
                warn!(error = %err, "waseet rejected token; re-authenticating");
                self.invalidate_token().await;
                let token = self.authenticate().await?;
                call(token).await.map_err(|err| match err {
                    CourierError::Unauthorized(msg) => CourierError::Auth(msg),
                    other => other,
                })
            }
            other => other,
        }
    }

    async fn list_orders(&self, token: String) -> Result<Vec<RemoteOrder>, CourierError> {
        let envelope: Envelope<Vec<WireOrder>> = self
            .http
            .get_json(&self.url("merchant-orders"), &[("token", token.as_str())])
            .await?;
        open_envelope(envelope)?
            .into_iter()
            .map(RemoteOrder::try_from)
            .collect()
    }

    async fn bulk_orders(&self, token: String, ids: &[String]) -> Result<Vec<RemoteOrder>, CourierError> {
        let form = [("ids", ids.join(","))];
        let envelope: Envelope<Vec<WireOrder>> = self
            .http
            .post_form(
                &self.url("get-orders-by-ids-bulk"),
                &[("token", token.as_str())],
                &form,
                Idempotency::Idempotent,
            )
            .await?;
        open_envelope(envelope)?
            .into_iter()
            .map(RemoteOrder::try_from)
            .collect()
    }

    async fn submit_order(&self, token: String, order: &NewCourierOrder) -> Result<CourierReceipt, CourierError> {
        let d = &order.details;
        let form = [
            ("client_name", d.customer_name.clone()),
            ("client_mobile", normalize_iraqi_phone(&d.customer_phone)),
            ("city_id", d.city_id.clone()),
            ("region_id", d.region_id.clone()),
            ("location", d.address.clone()),
            ("type_name", self.config.parcel_type_name.clone()),
            ("items_number", d.items_count.max(1).to_string()),
            ("price", format!("{:.0}", d.total_price)),
            ("package_size", order.package_size.clone()),
            ("merchant_notes", order.merchant_notes.clone().unwrap_or_default()),
            ("replacement", "0".to_string()),
        ];
        let envelope: Envelope<CreatedOrder> = self
            .http
            .post_form(
                &self.url("create-order"),
                &[("token", token.as_str())],
                &form,
                Idempotency::SingleShot,
            )
            .await?;
        let created = open_envelope(envelope)?;
        let courier_order_id = created.qr_id.into_string();
        if courier_order_id.is_empty() {
            return Err(CourierError::Malformed("created order without qr_id".into()));
        }
        Ok(CourierReceipt {
            courier_order_id,
            tracking_link: created.qr_link,
        })
    }
}

#[async_trait]
impl CourierClient for WaseetClient {
    fn name(&self) -> &'static str {
        "waseet"
    }

    async fn fetch_all_merchant_orders(&self) -> Result<Vec<RemoteOrder>, CourierError> {
        let orders = self.with_token(|token| self.list_orders(token)).await?;
        debug!(count = orders.len(), "fetched waseet merchant orders");
        Ok(orders)
    }

    async fn fetch_orders_by_ids(&self, ids: &[String]) -> Result<Vec<RemoteOrder>, CourierError> {
        let mut out = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(MAX_IDS_PER_BULK_CALL) {
            let batch = self
                .with_token(|token| self.bulk_orders(token, chunk))
                .await?;
            out.extend(batch);
        }
        Ok(out)
    }

    async fn create_order(&self, order: &NewCourierOrder) -> Result<CourierReceipt, CourierError> {
        let d = &order.details;
        if d.customer_name.trim().is_empty() || d.customer_phone.trim().is_empty() {
            return Err(CourierError::InvalidRequest(format!(
                "order {} lacks customer name or phone",
                order.local_order_id
            )));
        }
        self.with_token(|token| self.submit_order(token, order)).await
    }
}

fn open_envelope<T>(envelope: Envelope<T>) -> Result<T, CourierError> {
    let code = envelope
        .err_num
        .as_ref()
        .map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    let message = envelope.msg.unwrap_or_default();

    if !envelope.status {
        if code == INVALID_TOKEN_ERR {
            return Err(CourierError::Unauthorized(message));
        }
        return Err(CourierError::Provider { code, message });
    }
    envelope
        .data
        .ok_or_else(|| CourierError::Malformed("successful response without data".into()))
}

/// Waseet expects mobiles in `+964XXXXXXXXXX` form.
pub fn normalize_iraqi_phone(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if let Some(rest) = digits.strip_prefix("+964") {
        format!("+964{rest}")
    } else if let Some(rest) = digits.strip_prefix("00964") {
        format!("+964{rest}")
    } else if let Some(rest) = digits.strip_prefix("964") {
        format!("+964{rest}")
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("+964{rest}")
    } else {
        digits
    }
}
