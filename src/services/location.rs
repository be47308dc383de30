use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;

use crate::models::flag::GeoFix;

/// Source of the device's current position.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_fix(&self) -> Result<GeoFix, LocationError>;
}

#[derive(Debug, Deserialize)]
struct FixRecord {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    recorded_at: Option<DateTime<Utc>>,
}

/// Last fix written as JSON by the platform location daemon.
pub struct FixFileLocation {
    path: PathBuf,
    max_age: Option<chrono::Duration>,
}

impl FixFileLocation {
    pub fn new(path: PathBuf) -> Self {
        Self { path, max_age: None }
    }

    /// Reject fixes older than `max_age` when they carry a timestamp.
    pub fn with_max_age(mut self, max_age: chrono::Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

#[async_trait]
impl LocationProvider for FixFileLocation {
    async fn current_fix(&self) -> Result<GeoFix, LocationError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(LocationError::PermissionDenied);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LocationError::NoFix);
            }
            Err(e) => return Err(e.into()),
        };

        let record: FixRecord = serde_json::from_str(&raw)?;
        if let (Some(max_age), Some(recorded_at)) = (self.max_age, record.recorded_at) {
            if Utc::now() - recorded_at > max_age {
                return Err(LocationError::Stale(recorded_at));
            }
        }

        if !(-90.0..=90.0).contains(&record.latitude) || !(-180.0..=180.0).contains(&record.longitude) {
            return Err(LocationError::OutOfRange);
        }

        Ok(GeoFix {
            latitude: record.latitude,
            longitude: record.longitude,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("No location fix available")]
    NoFix,

    #[error("Last fix is stale (recorded at {0})")]
    Stale(DateTime<Utc>),

    #[error("Fix coordinates out of range")]
    OutOfRange,

    #[error("Location request timed out")]
    Timeout,

    #[error("Malformed fix: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
