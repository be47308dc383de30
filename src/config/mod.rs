use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::backoff::Backoff;
use crate::services::camera::StillSettings;
use crate::services::capture::CaptureSettings;
use crate::services::queue::WorkerSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Local control surface bind address (e.g., "127.0.0.1:7780").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite connection string for the durable upload queue
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Backend base URL for uploads and login
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Redis connection string for the remote flag store. In-memory store when unset.
    pub redis_url: Option<String>,

    /// Fixed user id, bypassing the stored session
    pub user_id: Option<String>,

    /// Where the signed-in session is persisted
    #[serde(default = "default_session_path")]
    pub session_path: PathBuf,

    /// Credentials used to sign in when no session exists
    pub login_email: Option<String>,
    pub login_password: Option<String>,
    pub device_id: Option<String>,

    /// Directory for captured still images awaiting upload
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,

    /// Snapshot files published by the platform camera daemon, one per lens
    #[serde(default = "default_back_frame")]
    pub camera_back_source: PathBuf,
    #[serde(default = "default_front_frame")]
    pub camera_front_source: PathBuf,

    /// Last-fix JSON written by the platform location daemon
    #[serde(default = "default_location_fix")]
    pub location_fix_path: PathBuf,

    #[serde(default = "default_failure_threshold")]
    pub auth_failure_threshold: u32,

    #[serde(default = "default_max_retries")]
    pub upload_max_retries: i32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    #[serde(default = "default_capture_step_timeout_secs")]
    pub capture_step_timeout_secs: u64,

    #[serde(default = "default_location_timeout_secs")]
    pub location_timeout_secs: u64,

    /// Bound on how long an auth event handler waits for its dispatch
    #[serde(default = "default_dispatch_deadline_secs")]
    pub dispatch_deadline_secs: u64,

    #[serde(default = "default_connectivity_probe_secs")]
    pub connectivity_probe_secs: u64,

    #[serde(default = "default_still_max_edge")]
    pub still_max_edge: u32,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Capture evidence for the session user when the agent is asked to stop
    #[serde(default)]
    pub capture_on_shutdown: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7780".to_string()
}

fn default_database_url() -> String {
    "sqlite://device-guard.db".to_string()
}

fn default_api_base_url() -> String {
    "https://login.pinaksecurity.com".to_string()
}

fn default_session_path() -> PathBuf {
    PathBuf::from("session.json")
}

fn default_capture_dir() -> PathBuf {
    std::env::temp_dir().join("device-guard")
}

fn default_back_frame() -> PathBuf {
    PathBuf::from("/run/device-guard/frames/back.jpg")
}

fn default_front_frame() -> PathBuf {
    PathBuf::from("/run/device-guard/frames/front.jpg")
}

fn default_location_fix() -> PathBuf {
    PathBuf::from("/run/device-guard/location.json")
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_max_retries() -> i32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    30_000
}

fn default_backoff_max_ms() -> u64 {
    30 * 60 * 1000
}

fn default_upload_timeout_secs() -> u64 {
    60
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_capture_step_timeout_secs() -> u64 {
    15
}

fn default_location_timeout_secs() -> u64 {
    30
}

fn default_dispatch_deadline_secs() -> u64 {
    10
}

fn default_connectivity_probe_secs() -> u64 {
    30
}

fn default_still_max_edge() -> u32 {
    1280
}

fn default_jpeg_quality() -> u8 {
    80
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    pub fn capture_step_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_step_timeout_secs)
    }

    pub fn location_timeout(&self) -> Duration {
        Duration::from_secs(self.location_timeout_secs)
    }

    pub fn dispatch_deadline(&self) -> Duration {
        Duration::from_secs(self.dispatch_deadline_secs)
    }

    pub fn connectivity_probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_probe_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_millis(self.backoff_max_ms),
            ),
            attempt_timeout: self.upload_timeout(),
            concurrency: self.upload_concurrency,
            idle_poll: Duration::from_secs(5),
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            capture_dir: self.capture_dir.clone(),
            still: StillSettings {
                max_long_edge: self.still_max_edge,
                jpeg_quality: self.jpeg_quality.clamp(1, 100),
            },
            step_timeout: self.capture_step_timeout(),
            location_timeout: self.location_timeout(),
        }
    }
}
