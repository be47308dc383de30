use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::flag::GeoFix;

/// Camera lens a capture step binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Lens {
    Back,
    Front,
}

/// Progress of a capture job through the hardware sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    Pending,
    CapturingBack,
    CapturingFront,
    LocationFetch,
    Ready,
    Failed,
}

impl CaptureStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureStatus::Ready | CaptureStatus::Failed)
    }

    /// True once the job has touched camera hardware.
    pub fn has_started_hardware(&self) -> bool {
        !matches!(self, CaptureStatus::Pending)
    }
}

/// One request for front/back photos plus a location fix for a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJob {
    pub id: Uuid,
    pub user_id: String,
    pub requested_at: DateTime<Utc>,
    pub front_image_path: Option<PathBuf>,
    pub back_image_path: Option<PathBuf>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status: CaptureStatus,
}

impl CaptureJob {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            requested_at: Utc::now(),
            front_image_path: None,
            back_image_path: None,
            latitude: None,
            longitude: None,
            status: CaptureStatus::Pending,
        }
    }

    pub fn set_image(&mut self, lens: Lens, path: PathBuf) {
        match lens {
            Lens::Back => self.back_image_path = Some(path),
            Lens::Front => self.front_image_path = Some(path),
        }
    }

    pub fn set_fix(&mut self, fix: GeoFix) {
        self.latitude = Some(fix.latitude);
        self.longitude = Some(fix.longitude);
    }

    pub fn fix(&self) -> Option<GeoFix> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(GeoFix { latitude, longitude }),
            _ => None,
        }
    }

    pub fn has_images(&self) -> bool {
        self.front_image_path.is_some() || self.back_image_path.is_some()
    }
}
