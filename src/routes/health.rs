use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
    pub queue_depth: Option<i64>,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub flag_store: ComponentHealth,
    pub network: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn ok(latency_ms: Option<u64>) -> Self {
        Self {
            status: "ok".to_string(),
            latency_ms,
        }
    }

    fn down(status: &str) -> Self {
        Self {
            status: status.to_string(),
            latency_ms: None,
        }
    }
}

/// GET /health: dependency status and upload backlog.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let db_check = match state.queue.health_check().await {
        Ok(_) => ComponentHealth::ok(Some(start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::down("error"),
    };

    let store_start = std::time::Instant::now();
    let store_check = match state.flag_store.health_check().await {
        Ok(_) => ComponentHealth::ok(Some(store_start.elapsed().as_millis() as u64)),
        Err(_) => ComponentHealth::down("error"),
    };

    // Offline only delays uploads; it does not make the agent unhealthy.
    let network_check = if state.connectivity.is_online() {
        ComponentHealth::ok(None)
    } else {
        ComponentHealth::down("offline")
    };

    let queue_depth = state.queue.depth().await.ok();

    let all_healthy = db_check.status == "ok" && store_check.status == "ok";
    let status_code = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if all_healthy {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database: db_check,
            flag_store: store_check,
            network: network_check,
        },
        queue_depth,
    };

    (status_code, Json(response))
}
