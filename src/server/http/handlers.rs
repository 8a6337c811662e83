//! Read-only operator handlers: call listing, call details, engine
//! statistics, and health.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::engine::EngineError;

use super::routes::AppState;

/// Error payload shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
    }
}

/// GET /calls
pub async fn list_calls(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, EngineError> {
    Ok(Json(state.engine.list_calls().await?))
}

/// GET /calls/{id}, the engine's full query tree as JSON.
pub async fn call_details(
    State(state): State<Arc<AppState>>,
    Path(call_id): Path<String>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let details = state.engine.query_call(&call_id).await?;
    Ok(Json(details.to_json()))
}

/// GET /stats
pub async fn statistics(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, EngineError> {
    let stats = state.engine.statistics().await?;
    Ok(Json(stats.to_json()))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub engine_address: String,
    pub spy: crate::server::metrics::MetricsSnapshot,
}

/// GET /health/detailed
pub async fn detailed_health(State(state): State<Arc<AppState>>) -> Json<DetailedHealthResponse> {
    Json(DetailedHealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        engine_address: state.engine_addr.clone(),
        spy: state.metrics.snapshot(),
    })
}
