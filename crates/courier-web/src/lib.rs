//! Operational HTTP surface for the reconciliation service.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_sync::{PassOutcome, SchedulerError, SyncScheduler};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "courier-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<SyncScheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<SyncScheduler>) -> Self {
        Self { scheduler }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sync/stats", get(stats_handler))
        .route("/sync/run", post(run_handler))
        .route("/sync/start", post(start_handler))
        .route("/sync/stop", post(stop_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "ops endpoint listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "courier": state.scheduler.reconciler().courier_name(),
        "scheduler_running": state.scheduler.is_running().await,
        "currently_syncing": state.scheduler.reconciler().is_syncing(),
    }))
    .into_response()
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.scheduler.stats()).into_response()
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.force_run().await {
        PassOutcome::Completed(report) => Json(report).into_response(),
        PassOutcome::Busy => error_response(StatusCode::CONFLICT, "sync already in progress"),
        PassOutcome::Failed { stage, error } => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": error, "stage": stage })),
        )
            .into_response(),
    }
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.start().await {
        Ok(()) => Json(json!({ "running": true })).into_response(),
        Err(err) => scheduler_error(err),
    }
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.stop().await {
        Ok(()) => Json(json!({ "running": false })).into_response(),
        Err(err) => scheduler_error(err),
    }
}

fn scheduler_error(err: SchedulerError) -> Response {
    let status = match err {
        SchedulerError::AlreadyRunning | SchedulerError::NotRunning => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use courier_adapters::{CourierClient, CourierError};
    use courier_core::{CanonicalStatus, CourierReceipt, NewCourierOrder, Order, RemoteOrder};
    use courier_storage::MemoryOrderStore;
    use courier_sync::{LogSender, Reconciler, SchedulerConfig, SyncPolicy};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[derive(Default)]
    struct StaticCourier {
        fail: AtomicBool,
    }

    #[async_trait]
    impl CourierClient for StaticCourier {
        fn name(&self) -> &'static str {
            "static"
        }

        async fn fetch_all_merchant_orders(&self) -> Result<Vec<RemoteOrder>, CourierError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CourierError::Auth("bad credentials".into()));
            }
            Ok(vec![RemoteOrder {
                id: "W1".into(),
                tracking_id: None,
                status_code: 4,
                status_text: "delivered".into(),
                tracking_link: None,
            }])
        }

        async fn fetch_orders_by_ids(&self, _ids: &[String]) -> Result<Vec<RemoteOrder>, CourierError> {
            Ok(Vec::new())
        }

        async fn create_order(&self, order: &NewCourierOrder) -> Result<CourierReceipt, CourierError> {
            Ok(CourierReceipt {
                courier_order_id: order.local_order_id.clone(),
                tracking_link: None,
            })
        }
    }

    fn state(fail: bool) -> AppState {
        let mut order = Order::new("w1", CanonicalStatus::InDelivery);
        order.courier_order_id = Some("W1".into());
        let store = Arc::new(MemoryOrderStore::with_orders([order]));
        let courier = Arc::new(StaticCourier::default());
        courier.fail.store(fail, Ordering::SeqCst);
        let reconciler = Arc::new(Reconciler::new(
            courier,
            store,
            Arc::new(LogSender),
            &SyncPolicy::default(),
            Duration::from_secs(5),
        ));
        AppState::new(Arc::new(SyncScheduler::new(
            reconciler,
            SchedulerConfig {
                interval: Duration::from_secs(3600),
                run_on_start: false,
                shutdown_grace: Duration::from_secs(1),
            },
        )))
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_scheduler_state() {
        let resp = app(state(false))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["courier"], "static");
        assert_eq!(body["scheduler_running"], false);
    }

    #[tokio::test]
    async fn forced_run_returns_the_report_and_updates_stats() {
        let app = app(state(false));
        let resp = app.clone().oneshot(post("/sync/run")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["updated"], 1);

        let stats = app
            .oneshot(Request::builder().uri("/sync/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(stats).await;
        assert_eq!(body["total_passes"], 1);
        assert_eq!(body["orders_updated"], 1);
        assert_eq!(body["last_report"]["matched"], 1);
    }

    #[tokio::test]
    async fn failed_pass_maps_to_bad_gateway() {
        let resp = app(state(true)).oneshot(post("/sync/run")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(json_body(resp).await["stage"], "fetching_remote");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_report_conflicts() {
        let app = app(state(false));
        assert_eq!(app.clone().oneshot(post("/sync/stop")).await.unwrap().status(), StatusCode::CONFLICT);
        assert_eq!(app.clone().oneshot(post("/sync/start")).await.unwrap().status(), StatusCode::OK);
        assert_eq!(app.clone().oneshot(post("/sync/start")).await.unwrap().status(), StatusCode::CONFLICT);
        assert_eq!(app.oneshot(post("/sync/stop")).await.unwrap().status(), StatusCode::OK);
    }
}
