use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// The remote boolean flags an operator console sets to request evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FlagKind {
    LocationRequired,
    CaptureRequired,
}

impl FlagKind {
    pub const ALL: [FlagKind; 2] = [FlagKind::LocationRequired, FlagKind::CaptureRequired];

    /// Store path of this flag for `user_id`.
    pub fn path(&self, user_id: &str) -> String {
        match self {
            FlagKind::LocationRequired => format!("users/{user_id}/Tracking/isLocationRequire"),
            FlagKind::CaptureRequired => format!("users/{user_id}/CaptureImage/isCaptureImage"),
        }
    }
}

/// Store path the agent writes every location fix to.
pub fn location_path(user_id: &str) -> String {
    format!("users/{user_id}/Tracking/location")
}

/// One observed value of a remote flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFlag {
    pub user_id: String,
    pub kind: FlagKind,
    pub value: bool,
}

/// A latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFix {
    pub latitude: f64,
    pub longitude: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_paths() {
        assert_eq!(
            FlagKind::LocationRequired.path("42"),
            "users/42/Tracking/isLocationRequire"
        );
        assert_eq!(
            FlagKind::CaptureRequired.path("42"),
            "users/42/CaptureImage/isCaptureImage"
        );
        assert_eq!(location_path("42"), "users/42/Tracking/location");
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(FlagKind::CaptureRequired.to_string(), "capture_required");
        assert_eq!(
            "location_required".parse::<FlagKind>().unwrap(),
            FlagKind::LocationRequired
        );
    }
}
