//! JSON control API over the import service, consumed by the maintenance UI.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use kef_core::{FailedImport, ImportCursor};
use kef_sync::{
    CycleReport, ImportError, ImportService, ImportStatus, PollerSettings, RetryAllReport,
    RetryReport, SourceCheck,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "kef-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ImportService>,
}

impl AppState {
    pub fn new(service: Arc<ImportService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfigRequest {
    pub source_url: String,
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct SourceRequest {
    pub source_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CursorRequest {
    pub row_number: u32,
}

#[derive(Debug, Serialize)]
struct Toggled {
    changed: bool,
}

#[derive(Debug, Serialize)]
struct Deleted {
    deleted: u64,
}

/// `ImportError` rendered as `{ "error": { "code", "message" } }`.
#[derive(Debug)]
pub struct ApiError(ImportError);

impl From<ImportError> for ApiError {
    fn from(err: ImportError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            ImportError::FailureNotFound(_) => (StatusCode::NOT_FOUND, "failure_not_found"),
            ImportError::RowNotFound { .. } => (StatusCode::NOT_FOUND, "row_not_found"),
            ImportError::NoActiveConfig => (StatusCode::CONFLICT, "no_active_config"),
            ImportError::AlreadyResolved(_) => (StatusCode::CONFLICT, "already_resolved"),
            ImportError::InvalidSource(_) => (StatusCode::BAD_REQUEST, "invalid_source"),
            ImportError::InvalidCursor(_) => (StatusCode::BAD_REQUEST, "invalid_cursor"),
            ImportError::InvalidInterval(_) => (StatusCode::BAD_REQUEST, "invalid_interval"),
            ImportError::Fetch(_) => (StatusCode::BAD_GATEWAY, "source_unavailable"),
            ImportError::Store(_) | ImportError::Row(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self.0, code, "control request failed");
        }
        let body = Json(json!({
            "error": { "code": code, "message": self.0.to_string() }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/config", get(get_config_handler).put(set_config_handler))
        .route("/api/config/deactivate", post(deactivate_handler))
        .route("/api/config/check", post(check_source_handler))
        .route("/api/poller/start", post(start_handler))
        .route("/api/poller/stop", post(stop_handler))
        .route("/api/import/run", post(run_once_handler))
        .route("/api/cursor", put(reset_cursor_handler))
        .route(
            "/api/failures",
            get(list_failures_handler).delete(delete_all_failures_handler),
        )
        .route("/api/failures/retry-all", post(retry_all_handler))
        .route("/api/failures/{id}", delete(delete_failure_handler))
        .route("/api/failures/{id}/retry", post(retry_handler))
        .with_state(Arc::new(state))
}

/// Serve the control API, starting the poller first when configured to. Ctrl-C stops
/// the poller and then the server.
pub async fn serve(service: Arc<ImportService>, addr: &str, autostart: bool) -> anyhow::Result<()> {
    if autostart {
        service.start().await;
    }
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "control api listening");
    axum::serve(listener, app(AppState::new(service.clone())))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = %err, "listening for ctrl-c failed");
            }
        })
        .await?;
    service.stop().await;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let settings = PollerSettings::from_env();
    let service = Arc::new(ImportService::connect(&settings).await?);
    serve(service, &settings.web_addr, settings.autostart).await
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> ApiResult<ImportStatus> {
    Ok(Json(state.service.status().await?))
}

async fn get_config_handler(State(state): State<Arc<AppState>>) -> ApiResult<Option<ImportCursor>> {
    Ok(Json(state.service.get_config().await?))
}

async fn set_config_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ConfigRequest>,
) -> ApiResult<ImportCursor> {
    Ok(Json(
        state
            .service
            .set_config(&req.source_url, req.poll_interval_secs)
            .await?,
    ))
}

async fn deactivate_handler(State(state): State<Arc<AppState>>) -> ApiResult<Toggled> {
    let changed = state.service.deactivate().await?;
    Ok(Json(Toggled { changed }))
}

async fn check_source_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SourceRequest>,
) -> ApiResult<SourceCheck> {
    Ok(Json(state.service.check_source(&req.source_url).await?))
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Json<Toggled> {
    Json(Toggled {
        changed: state.service.start().await,
    })
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Json<Toggled> {
    Json(Toggled {
        changed: state.service.stop().await,
    })
}

async fn run_once_handler(State(state): State<Arc<AppState>>) -> ApiResult<CycleReport> {
    Ok(Json(state.service.run_once().await?))
}

async fn reset_cursor_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CursorRequest>,
) -> ApiResult<ImportCursor> {
    Ok(Json(state.service.reset_cursor(req.row_number).await?))
}

async fn list_failures_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<FailedImport>> {
    Ok(Json(state.service.list_failures().await?))
}

async fn retry_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<RetryReport> {
    Ok(Json(state.service.retry(id).await?))
}

async fn retry_all_handler(State(state): State<Arc<AppState>>) -> ApiResult<RetryAllReport> {
    Ok(Json(state.service.retry_all().await?))
}

async fn delete_failure_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_failure(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_failures_handler(State(state): State<Arc<AppState>>) -> ApiResult<Deleted> {
    let deleted = state.service.delete_all_failures().await?;
    Ok(Json(Deleted { deleted }))
}
