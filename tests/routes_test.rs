mod fixtures;
mod helpers;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use device_guard::{
    app_state::AppState,
    routes,
    services::{auth_monitor::FailedAuthMonitor, connectivity::Connectivity},
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use fixtures::{FIX, USER};
use helpers::Pipeline;

fn app(pipeline: &Pipeline, session_user: Option<&str>) -> Router {
    let monitor = FailedAuthMonitor::new(pipeline.dispatcher.clone(), 2, Duration::from_secs(2));
    let state = AppState::new(
        pipeline.queue.clone(),
        pipeline.dispatcher.clone(),
        monitor,
        pipeline.store.clone(),
        Connectivity::new(true),
        session_user.map(str::to_string),
    );
    routes::api_router(state)
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_auth_failures_fall_back_to_session_user() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    let app = app(&pipeline, Some(USER));

    let (status, body) = post(&app, "/api/v1/auth/failed", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_id"], USER);
    assert_eq!(body["consecutive_failures"], 1);
    assert!(body["dispatched"].is_null());

    let (_, body) = post(&app, "/api/v1/auth/failed", json!({})).await;
    assert_eq!(body["dispatched"]["outcome"], "capture_accepted");

    let (_, body) = post(&app, "/api/v1/auth/succeeded", json!({})).await;
    assert_eq!(body["consecutive_failures"], 0);
}

#[tokio::test]
async fn test_auth_event_without_any_user_is_unprocessable() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    let app = app(&pipeline, None);

    let (status, _) = post(&app, "/api/v1/auth/failed", json!({})).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_location_upload_is_validated_and_queued() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    let app = app(&pipeline, None);

    let (status, _) = post(
        &app,
        "/api/v1/uploads/location",
        json!({ "user_id": USER, "latitude": 123.0, "longitude": 0.0 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = post(
        &app,
        "/api/v1/uploads/location",
        json!({ "user_id": USER, "latitude": FIX.latitude, "longitude": FIX.longitude }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn test_capture_upload_requires_an_image() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    let app = app(&pipeline, None);

    let (status, _) = post(&app, "/api/v1/uploads/capture", json!({ "user_id": USER })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_capture_command_dedupes() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    let app = app(&pipeline, Some(USER));
    pipeline.camera.close_gate();

    let (_, first) = post(&app, "/api/v1/commands/capture", json!({})).await;
    assert_eq!(first["outcome"]["outcome"], "capture_accepted");

    let (_, second) = post(&app, "/api/v1/commands/capture", json!({ "user_id": USER })).await;
    assert_eq!(second["outcome"]["outcome"], "already_active");

    pipeline.camera.open_gate();
}

#[tokio::test]
async fn test_health_reports_queue_depth() {
    let pipeline = Pipeline::new(Some(FIX), 3).await;
    pipeline.queue.enqueue_location(USER, FIX).await.unwrap();
    let app = app(&pipeline, None);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["queue_depth"], 1);
}
