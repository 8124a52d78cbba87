//! HTTP API over the cache coordinator.
//!
//! - POST /v1/cache/lookup
//! - PUT /v1/cache/entries
//! - POST /v1/cache/invalidate
//! - GET /v1/cache/stats
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::cache::coordinator::{CacheCoordinator, CacheError, CacheStats};
use crate::cache::query::{MetricValue, QueryDescriptor};
use crate::cache::store::TierStats;
use crate::config::Config;

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: Arc<CacheCoordinator>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/cache/lookup", post(lookup))
        .route("/v1/cache/entries", put(store_entry))
        .route("/v1/cache/invalidate", post(invalidate))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LookupRequest {
    pub descriptor: QueryDescriptor,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LookupResponse {
    pub values: Vec<MetricValue>,
}

#[derive(Debug, Deserialize)]
pub struct StoreRequest {
    pub descriptor: QueryDescriptor,
    pub values: Vec<MetricValue>,
    /// Falls back to `cache.default_ttl_ms`.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// Cache statistics response.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub compression_ratio: f64,
    pub bytes_saved: u64,
    pub hit_rate: f64,
    pub tiers: TierStats,
}

impl StatsResponse {
    fn collect(coordinator: &CacheCoordinator) -> Self {
        let stats = coordinator.stats();
        Self {
            compression_ratio: stats.compression_ratio(),
            bytes_saved: stats.bytes_saved(),
            hit_rate: stats.hit_rate(),
            tiers: coordinator.tier_stats(),
            stats,
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: StatsResponse,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Maps a [`CacheError`] onto a status code.
#[derive(Debug)]
pub struct ApiError(CacheError);

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CacheError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            CacheError::SerializationFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CacheError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::DecompressionMismatch { .. }
            | CacheError::InvalidConfig(_)
            | CacheError::Metrics(_) => {
                error!(error = %self.0, "Unexpected cache error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn lookup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LookupRequest>,
) -> Result<Response, ApiError> {
    match state.coordinator.get(&req.descriptor).await? {
        Some(values) => Ok(Json(LookupResponse { values }).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

async fn store_entry(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StoreRequest>,
) -> Result<StatusCode, ApiError> {
    let ttl = req
        .ttl_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.cache.default_ttl());

    debug!(
        metric = %req.descriptor.metric_id,
        points = req.values.len(),
        ttl_ms = ttl.as_millis() as u64,
        "Store request"
    );
    state
        .coordinator
        .set(&req.descriptor, &req.values, ttl)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LookupRequest>,
) -> Result<StatusCode, ApiError> {
    state.coordinator.invalidate(&req.descriptor).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse::collect(&state.coordinator))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cache: StatsResponse::collect(&state.coordinator),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.coordinator.metrics().export(),
    )
}
