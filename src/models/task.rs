use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::capture::CaptureJob;
use crate::models::flag::GeoFix;

/// Kind of evidence an upload task delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CapturePayload,
    LocationPayload,
}

/// Status of an upload task in the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
}

/// Namespace for deterministic task ids derived from enqueue arguments.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x6d1f_3c0e_8a52_4b7e_9f0d_2c44_a1b8_e903);

/// A durable, retryable delivery of a capture result or location fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub user_id: String,
    pub front_image_path: Option<PathBuf>,
    pub back_image_path: Option<PathBuf>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub requires_network: bool,
    pub status: TaskStatus,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl UploadTask {
    fn base(id: Uuid, kind: TaskKind, user_id: &str, max_retries: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            user_id: user_id.to_string(),
            front_image_path: None,
            back_image_path: None,
            latitude: None,
            longitude: None,
            retry_count: 0,
            max_retries,
            requires_network: true,
            status: TaskStatus::Pending,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
        }
    }

    /// Capture task for a finished job. The task reuses the job id so that a
    /// job can never be enqueued twice.
    pub fn from_capture(job: &CaptureJob, max_retries: i32) -> Self {
        let mut task = Self::base(job.id, TaskKind::CapturePayload, &job.user_id, max_retries);
        task.front_image_path = job.front_image_path.clone();
        task.back_image_path = job.back_image_path.clone();
        task.latitude = job.latitude;
        task.longitude = job.longitude;
        task
    }

    /// Location-only task. With `id` unset the id is derived from the
    /// arguments, so repeated submissions of the same fix collapse.
    pub fn location(user_id: &str, fix: GeoFix, id: Option<Uuid>, max_retries: i32) -> Self {
        let id = id.unwrap_or_else(|| {
            let key = format!(
                "location:{user_id}:{:.6}:{:.6}",
                fix.latitude, fix.longitude
            );
            Uuid::new_v5(&TASK_NAMESPACE, key.as_bytes())
        });
        let mut task = Self::base(id, TaskKind::LocationPayload, user_id, max_retries);
        task.latitude = Some(fix.latitude);
        task.longitude = Some(fix.longitude);
        task
    }

    /// Capture task built from externally captured files.
    pub fn capture_files(
        user_id: &str,
        front: Option<PathBuf>,
        back: Option<PathBuf>,
        max_retries: i32,
    ) -> Self {
        let key = format!(
            "capture:{user_id}:{}:{}",
            front.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
            back.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        );
        let id = Uuid::new_v5(&TASK_NAMESPACE, key.as_bytes());
        let mut task = Self::base(id, TaskKind::CapturePayload, user_id, max_retries);
        task.front_image_path = front;
        task.back_image_path = back;
        task
    }

    /// Local files owned by this task, deleted once it is terminal.
    pub fn artifacts(&self) -> impl Iterator<Item = &PathBuf> {
        self.front_image_path
            .iter()
            .chain(self.back_image_path.iter())
    }

    pub fn fix(&self) -> Option<GeoFix> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoFix { latitude, longitude }),
            _ => None,
        }
    }
}

/// Outcome of a task that left the queue without succeeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalFailure {
    pub task_id: Uuid,
    pub kind: TaskKind,
    pub user_id: String,
    pub attempts: i32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}
