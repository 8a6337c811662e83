//! HTTP surface: read-only operator endpoints plus the spy signaling pair.

pub mod handlers;
pub mod routes;
pub mod spy_handlers;

pub use routes::{create_router, AppState};
