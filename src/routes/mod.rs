use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod commands;
pub mod health;
pub mod metrics;
pub mod uploads;

/// Local control routes sharing [`AppState`]. `/metrics` is mounted separately.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/auth/failed", post(commands::auth_failed))
        .route("/api/v1/auth/succeeded", post(commands::auth_succeeded))
        .route("/api/v1/commands/capture", post(commands::request_capture))
        .route("/api/v1/commands/location", post(commands::request_location))
        .route("/api/v1/uploads/capture", post(uploads::enqueue_capture))
        .route("/api/v1/uploads/location", post(uploads::enqueue_location))
        .with_state(state)
}
