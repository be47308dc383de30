use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use std::path::PathBuf;

use crate::app_state::AppState;
use crate::models::api::{CaptureUploadRequest, EnqueueResponse, LocationUploadRequest};
use crate::models::flag::GeoFix;
use crate::services::queue::QueueError;

/// POST /api/v1/uploads/capture: queue already captured stills for delivery.
pub async fn enqueue_capture(
    State(state): State<AppState>,
    Json(body): Json<CaptureUploadRequest>,
) -> Result<Json<EnqueueResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let task_id = state
        .queue
        .enqueue_capture(
            &body.user_id,
            body.front_path.map(PathBuf::from),
            body.back_path.map(PathBuf::from),
        )
        .await
        .map_err(|e| match e {
            QueueError::NothingToUpload => StatusCode::BAD_REQUEST,
            e => {
                tracing::error!(error = %e, "Failed to enqueue capture upload");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    Ok(Json(EnqueueResponse {
        task_id,
        status: "queued".to_string(),
    }))
}

/// POST /api/v1/uploads/location: queue a location fix for delivery.
pub async fn enqueue_location(
    State(state): State<AppState>,
    Json(body): Json<LocationUploadRequest>,
) -> Result<Json<EnqueueResponse>, StatusCode> {
    body.validate().map_err(|_| StatusCode::BAD_REQUEST)?;

    let fix = GeoFix {
        latitude: body.latitude,
        longitude: body.longitude,
    };
    let task_id = state
        .queue
        .enqueue_location(&body.user_id, fix)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to enqueue location upload");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(EnqueueResponse {
        task_id,
        status: "queued".to_string(),
    }))
}
