use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::services::dispatcher::DispatchOutcome;

/// Body of the local auth-event hooks. Without a user id the session user is used.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct AuthEventRequest {
    #[garde(length(min = 1, max = 128))]
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AuthEventResponse {
    pub user_id: String,
    pub consecutive_failures: u32,
    pub dispatched: Option<DispatchOutcome>,
}

/// Request to run a command for a user, mirroring a remote flag write.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct CommandRequest {
    #[garde(length(min = 1, max = 128))]
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub user_id: String,
    pub outcome: DispatchOutcome,
}

/// Enqueue already captured files for delivery.
#[derive(Debug, Deserialize, Validate)]
pub struct CaptureUploadRequest {
    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    #[garde(length(min = 1, max = 4096))]
    pub front_path: Option<String>,

    #[garde(length(min = 1, max = 4096))]
    pub back_path: Option<String>,
}

/// Enqueue a location fix for delivery.
#[derive(Debug, Deserialize, Validate)]
pub struct LocationUploadRequest {
    #[garde(length(min = 1, max = 128))]
    pub user_id: String,

    #[garde(range(min = -90.0, max = 90.0))]
    pub latitude: f64,

    #[garde(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub task_id: uuid::Uuid,
    pub status: String,
}
