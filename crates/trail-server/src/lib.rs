//! Trail server library logic.

pub mod api;
pub mod api_trails;
pub mod config;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use trail_core::TrailsManager;

/// Application state shared across all request handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Data access for the `trails` table.
    pub manager: TrailsManager,
}

/// Maximum request body size (2 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/trails",
            get(api_trails::search_trails_handler).post(api_trails::create_trail_handler),
        )
        .route(
            "/trails/enumerate",
            get(api_trails::enumerate_trails_handler),
        )
        .route(
            "/trails/{id}",
            get(api_trails::get_trail_handler)
                .put(api_trails::update_trail_handler)
                .delete(api_trails::delete_trail_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
