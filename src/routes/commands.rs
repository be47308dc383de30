use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::api::{AuthEventRequest, AuthEventResponse, CommandRequest, CommandResponse};
use crate::services::dispatcher::{Command, CommandSource};

fn resolve_user(state: &AppState, user_id: Option<String>) -> Result<String, StatusCode> {
    state.user_or_session(user_id).ok_or_else(|| {
        tracing::warn!("Request names no user and no session is loaded");
        StatusCode::UNPROCESSABLE_ENTITY
    })
}

/// POST /api/v1/auth/failed: device-admin hook for a failed unlock attempt.
pub async fn auth_failed(
    State(state): State<AppState>,
    Json(body): Json<AuthEventRequest>,
) -> Result<Json<AuthEventResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;
    let user_id = resolve_user(&state, body.user_id)?;

    let outcome = state.monitor.on_failure(&user_id).await;
    Ok(Json(AuthEventResponse {
        user_id,
        consecutive_failures: outcome.consecutive_failures,
        dispatched: outcome.dispatched,
    }))
}

/// POST /api/v1/auth/succeeded: device-admin hook for a successful unlock.
pub async fn auth_succeeded(
    State(state): State<AppState>,
    Json(body): Json<AuthEventRequest>,
) -> Result<Json<AuthEventResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;
    let user_id = resolve_user(&state, body.user_id)?;

    let outcome = state.monitor.on_success(&user_id).await;
    Ok(Json(AuthEventResponse {
        user_id,
        consecutive_failures: outcome.consecutive_failures,
        dispatched: outcome.dispatched,
    }))
}

/// POST /api/v1/commands/capture: request a capture as if the remote flag were set.
pub async fn request_capture(
    State(state): State<AppState>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;
    let user_id = resolve_user(&state, body.user_id)?;

    let outcome = state
        .dispatcher
        .dispatch(Command::CaptureRequested {
            user_id: user_id.clone(),
            source: CommandSource::Api,
        })
        .await;
    Ok(Json(CommandResponse { user_id, outcome }))
}

/// POST /api/v1/commands/location: request a location fix.
pub async fn request_location(
    State(state): State<AppState>,
    Json(body): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;
    let user_id = resolve_user(&state, body.user_id)?;

    let outcome = state
        .dispatcher
        .dispatch(Command::LocationRequested {
            user_id: user_id.clone(),
            source: CommandSource::Api,
        })
        .await;
    Ok(Json(CommandResponse { user_id, outcome }))
}
