use crate::config::ApiConfig;
use crate::export::{export_scans, ExportError, EXPORT_FILENAME, XLSX_CONTENT_TYPE};
use crate::query::{ExportScansParams, ListScansParams, ScanFilter};
use crate::schema::{self, Scan, ScanCreate};
use crate::store::ScanStore;
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ScanStore>,
}

/// Plain `{message}` response body
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Failures surfaced to API callers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Failed to delete records: {0}")]
    DeleteFailed(String),

    #[error("Internal Server Error")]
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::DeleteFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Internal(e) => {
                error!(error = ?e, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<ExportError> for ApiError {
    fn from(e: ExportError) -> Self {
        match e {
            ExportError::NoMatches => ApiError::NotFound(ExportError::NoMatches.to_string()),
            ExportError::Other(e) => ApiError::Internal(e),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(root))
        .route("/ready", get(readiness_check))
        .route("/scans/", get(list_scans).post(create_scan).delete(delete_all_scans))
        .route("/scans", get(list_scans).post(create_scan).delete(delete_all_scans))
        .route("/scans/export/", get(export_scans_file))
        .route("/scans/export", get(export_scans_file))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn root() -> Json<MessageResponse> {
    Json(MessageResponse {
        message: "Barcode Scan API is running".to_string(),
    })
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": format!("{e:#}")
            })),
        ),
    }
}

/// Record a new scan, stamped with server time
#[instrument(skip(state, payload))]
async fn create_scan(
    State(state): State<AppState>,
    payload: Result<Json<ScanCreate>, JsonRejection>,
) -> Result<(StatusCode, Json<Scan>), ApiError> {
    let Json(create) = payload?;

    let mut session = state.store.session().await?;
    let scan = session.insert(&create.barcode, schema::now()).await?;

    metrics::counter!("scans.created").increment(1);
    Ok((StatusCode::CREATED, Json(scan)))
}

/// List scans with filtering and pagination
#[instrument(skip(state))]
async fn list_scans(
    State(state): State<AppState>,
    params: Result<Query<ListScansParams>, QueryRejection>,
) -> Result<Json<Vec<Scan>>, ApiError> {
    let Query(params) = params?;
    let (filter, page) = params.into_parts();

    let mut session = state.store.session().await?;
    let scans = session.select(&filter, Some(page)).await?;

    metrics::counter!("scans.listed").increment(1);
    Ok(Json(scans))
}

/// Export filtered scans as an xlsx download
#[instrument(skip(state))]
async fn export_scans_file(
    State(state): State<AppState>,
    params: Result<Query<ExportScansParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let filter = ScanFilter::from(params);

    let mut session = state.store.session().await?;
    let workbook = export_scans(&mut session, &filter).await.map_err(|e| {
        if matches!(e, ExportError::NoMatches) {
            metrics::counter!("scans.export.not_found").increment(1);
        }
        ApiError::from(e)
    })?;

    let disposition = format!("attachment; filename=\"{EXPORT_FILENAME}\"");
    Ok((
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        workbook,
    )
        .into_response())
}

/// Delete every scan
#[instrument(skip(state))]
async fn delete_all_scans(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    let deleted = delete_everything(&state.store).await.map_err(|e| {
        let detail = format!("{e:#}");
        warn!(error = %detail, "Delete all scans failed");
        ApiError::DeleteFailed(detail)
    })?;

    metrics::counter!("scans.deleted").increment(deleted);
    Ok(Json(MessageResponse {
        message: format!("Successfully deleted {deleted} scan records."),
    }))
}

// Session acquisition and the delete share one failure scope
async fn delete_everything(store: &ScanStore) -> Result<u64> {
    let mut session = store.session().await?;
    session.delete_all().await
}

/// Start the scan API server, stopping when `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting scan API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
