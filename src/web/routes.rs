use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

use super::handlers;
use super::state::AppState;

// API Routes - REST API for programmatic access
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().nest(
        "/api",
        Router::new()
            // Question answering
            .route("/ask", post(handlers::api::ask))
            // Schema
            .route("/schema", get(handlers::api::get_schema))
            .route("/schema/refresh", post(handlers::api::refresh_schema))
            // Browsing and loading data
            .route("/tables/{table}", get(handlers::api::get_table))
            // Keys
            .route(
                "/tables/{table}/primary-key",
                put(handlers::api::set_primary_key).delete(handlers::api::remove_primary_key),
            )
            .route("/tables/{table}/foreign-keys", post(handlers::api::add_foreign_key))
            .route(
                "/tables/{table}/foreign-keys/{column}",
                delete(handlers::api::remove_foreign_key),
            )
            .route("/upload", post(handlers::api::upload_file))
            // System status
            .route("/status", get(handlers::api::system_status)),
    )
}
