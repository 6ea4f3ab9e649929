//! Blob cache HTTP API.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET, PUT, DELETE /v1/blobs/{key}
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, MatchedPath, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::cache::disk::DiskLruCache;
use crate::cache::lru::LruStats;
use crate::error::CacheError;
use crate::metrics::CacheMetrics;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: DiskLruCache,
    pub metrics: CacheMetrics,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(cache: DiskLruCache, metrics: CacheMetrics) -> Self {
        Self {
            cache,
            metrics,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route(
            "/v1/blobs/{key}",
            get(get_blob).put(put_blob).delete(delete_blob),
        )
        .route("/metrics", get(metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .with_state(state)
}

// ─── Errors ────────────────────────────────────────────────────────────────

/// Handler failure mapped to an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Cache(CacheError),
    Internal(String),
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        ApiError::Cache(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Cache(err @ CacheError::InvalidKey { .. }) => {
                (StatusCode::BAD_REQUEST, err.to_string()).into_response()
            }
            ApiError::Cache(err) => {
                error!(error = %err, "Cache operation failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request handler failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

/// Run a blocking cache call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

async fn track_requests(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(req).await;
    state
        .metrics
        .observe_request(&route, response.status().as_u16());
    response
}

// ─── Response Types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: LruStats,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let cache = state.cache.clone();
    let stats = blocking(move || cache.stats()).await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: stats,
    }))
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<LruStats>, ApiError> {
    let cache = state.cache.clone();
    Ok(Json(blocking(move || cache.stats()).await?))
}

async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let cache = state.cache.clone();
    let lookup = key.clone();
    match blocking(move || cache.get(&lookup)).await? {
        Some(data) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Bytes::from(data),
        )
            .into_response()),
        None => {
            debug!(key = %key, "Blob not found");
            Ok(StatusCode::NOT_FOUND.into_response())
        }
    }
}

async fn put_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let cache = state.cache.clone();
    blocking(move || cache.put(&key, &body)).await?;
    Ok(StatusCode::CREATED)
}

async fn delete_blob(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    let cache = state.cache.clone();
    if blocking(move || cache.remove(&key)).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let cache = state.cache.clone();
    let stats = blocking(move || cache.stats()).await?;
    state.metrics.update(&stats);

    let (content_type, body) = state
        .metrics
        .render()
        .map_err(|e| ApiError::Internal(format!("metrics encoding failed: {e}")))?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}
