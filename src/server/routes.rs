//! Router configuration for the HTTP surface.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/convert", get(handlers::convert))
        // Janitor
        .route("/clearimg", get(handlers::clear_images))
        .route("/clearpdf", get(handlers::clear_staging))
        .route("/clearblocks", get(handlers::clear_blocklist))
        .route("/clearall", get(handlers::clear_all))
        // Operations
        .route("/status", get(handlers::status))
        .route("/log", get(handlers::log_file))
        .route("/kill", get(handlers::kill))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
