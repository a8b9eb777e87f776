//! Courier provider contracts, the Waseet adapter, and status-code mapping.

use async_trait::async_trait;
use courier_core::{CourierReceipt, NewCourierOrder, RemoteOrder};
use courier_storage::FetchError;
use thiserror::Error;

pub mod status_map;
pub mod waseet;

pub use status_map::{StatusMapper, SAFE_DEFAULT, WASEET_STATUS_TABLE};
pub use waseet::{WaseetClient, WaseetConfig};

pub const CRATE_NAME: &str = "courier-adapters";

/// Upper bound on ids accepted by one bulk lookup call.
pub const MAX_IDS_PER_BULK_CALL: usize = 25;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("courier transport failure: {0}")]
    Transport(FetchError),
    /// The provider rejected the current credential.
    #[error("courier rejected credential: {0}")]
    Unauthorized(String),
    /// Authentication failed even after a fresh login.
    #[error("courier authentication failed: {0}")]
    Auth(String),
    #[error("courier error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("malformed courier response: {0}")]
    Malformed(String),
    #[error("invalid courier request: {0}")]
    InvalidRequest(String),
}

impl CourierError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, CourierError::Unauthorized(_))
    }
}

impl From<FetchError> for CourierError {
    fn from(err: FetchError) -> Self {
        if err.is_unauthorized() {
            CourierError::Unauthorized(err.to_string())
        } else if matches!(err, FetchError::Decode { .. }) {
            CourierError::Malformed(err.to_string())
        } else {
            CourierError::Transport(err)
        }
    }
}

/// Merchant-side view of a courier provider.
///
/// Calls are all-or-nothing: a partial listing is reported as an error.
#[async_trait]
pub trait CourierClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_all_merchant_orders(&self) -> Result<Vec<RemoteOrder>, CourierError>;

    async fn fetch_orders_by_ids(&self, ids: &[String]) -> Result<Vec<RemoteOrder>, CourierError>;

    async fn create_order(&self, order: &NewCourierOrder) -> Result<CourierReceipt, CourierError>;
}
