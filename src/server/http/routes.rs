//! Router assembly and shared handler state.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::engine;
use crate::server::metrics::MonitorMetrics;
use crate::server::spy::SpyService;

use super::{handlers, spy_handlers};

/// State shared across all handlers.
pub struct AppState {
    pub engine: Arc<dyn engine::Client>,
    pub spy: Arc<SpyService>,
    pub metrics: Arc<MonitorMetrics>,
    pub engine_addr: String,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn engine::Client>,
        spy: Arc<SpyService>,
        metrics: Arc<MonitorMetrics>,
        engine_addr: String,
    ) -> Self {
        Self {
            engine,
            spy,
            metrics,
            engine_addr,
            started_at: Instant::now(),
        }
    }
}

/// Build the operator router.
///
/// # Routes
///
/// - `GET /calls` - active call ids
/// - `GET /calls/{id}` - engine query tree for one call
/// - `GET /stats` - engine statistics tree
/// - `GET /health`, `GET /health/detailed` - process health
/// - `POST /spy/{call_id}` - create or join a spy source, returns an offer
/// - `POST /spy/answer/{session_id}` - deliver the browser's answer
///
/// Everything else falls through to the static operator UI.
pub fn create_router(state: Arc<AppState>, static_dir: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/calls", get(handlers::list_calls))
        .route("/calls/{id}", get(handlers::call_details))
        .route("/stats", get(handlers::statistics))
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health))
        .route("/spy/{call_id}", post(spy_handlers::start_spy))
        .route("/spy/answer/{session_id}", post(spy_handlers::submit_answer))
        .fallback_service(ServeDir::new(static_dir))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
