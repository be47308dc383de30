use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::models::task::{TaskKind, UploadTask};

/// Backend routes evidence is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Location,
    TrackData,
    CapturePicture,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Location => "/api/update/location",
            Endpoint::TrackData => "/api/update/track_data",
            Endpoint::CapturePicture => "/api/update/capture_picture",
        }
    }
}

/// One binary JPEG part of a multipart upload.
#[derive(Debug, Clone)]
pub struct ImagePart {
    pub field: &'static str,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Fully built multipart request for one task attempt.
#[derive(Debug, Clone)]
pub struct UploadPayload {
    pub endpoint: Endpoint,
    pub fields: Vec<(&'static str, String)>,
    pub images: Vec<ImagePart>,
}

impl UploadPayload {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_image(&self, field: &str) -> bool {
        self.images.iter().any(|p| p.field == field)
    }
}

/// Shortest round-trip decimal with a trailing ".0" for whole numbers.
fn raw_decimal(value: f64) -> String {
    format!("{value:?}")
}

async fn read_image(field: &'static str, path: &Path) -> Result<Option<ImagePart>, DeliveryError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(ImagePart {
            field,
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{field}.jpg")),
            bytes,
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(field, path = %path.display(), "Image missing at upload time, omitting");
            Ok(None)
        }
        Err(e) => Err(DeliveryError::Io(e)),
    }
}

/// Build the multipart payload for `task` from whatever fields are present.
///
/// Capture payloads carrying both images and no location fix go to the
/// picture endpoint; every other capture payload goes to track data with
/// absent coordinates sent as "0.0".
pub async fn build_payload(task: &UploadTask) -> Result<UploadPayload, DeliveryError> {
    let mut fields = vec![("user_id", task.user_id.clone())];

    match task.kind {
        TaskKind::LocationPayload => {
            let fix = task.fix().ok_or(DeliveryError::EmptyPayload)?;
            fields.push(("type", "location".to_string()));
            fields.push(("latitude", format!("{:.6}", fix.latitude)));
            fields.push(("longitude", format!("{:.6}", fix.longitude)));
            Ok(UploadPayload {
                endpoint: Endpoint::Location,
                fields,
                images: Vec::new(),
            })
        }
        TaskKind::CapturePayload => {
            let mut images = Vec::new();
            if let Some(path) = &task.front_image_path {
                images.extend(read_image("front_image", path).await?);
            }
            if let Some(path) = &task.back_image_path {
                images.extend(read_image("back_image", path).await?);
            }

            let fix = task.fix();
            if images.is_empty() && fix.is_none() {
                return Err(DeliveryError::EmptyPayload);
            }

            if images.len() == 2 && fix.is_none() {
                fields.push(("type", "camera".to_string()));
                return Ok(UploadPayload {
                    endpoint: Endpoint::CapturePicture,
                    fields,
                    images,
                });
            }

            fields.push(("type", "track".to_string()));
            fields.push((
                "latitude",
                task.latitude.map(raw_decimal).unwrap_or_else(|| "0.0".to_string()),
            ));
            fields.push((
                "longitude",
                task.longitude.map(raw_decimal).unwrap_or_else(|| "0.0".to_string()),
            ));
            Ok(UploadPayload {
                endpoint: Endpoint::TrackData,
                fields,
                images,
            })
        }
    }
}

/// Delivers payloads to the evidence backend.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn deliver(&self, payload: UploadPayload) -> Result<(), DeliveryError>;
}

/// Multipart HTTP client for the evidence backend.
pub struct HttpBackend {
    http: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DeliveryError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn http(&self) -> &Client {
        &self.http
    }
}

#[async_trait]
impl UploadBackend for HttpBackend {
    async fn deliver(&self, payload: UploadPayload) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.base_url, payload.endpoint.path());

        let mut form = Form::new();
        for (name, value) in payload.fields {
            form = form.text(name, value);
        }
        for image in payload.images {
            let part = Part::bytes(image.bytes)
                .file_name(image.file_name)
                .mime_str("image/jpeg")?;
            form = form.part(image.field, part);
        }

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(DeliveryError::from_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::from_status(status, body))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Upload timed out")]
    Timeout,

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Upload rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Nothing left to deliver")]
    EmptyPayload,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliveryError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Network(e)
        }
    }

    fn from_status(status: StatusCode, body: String) -> Self {
        let transient = status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS;
        if transient {
            DeliveryError::Server { status: status.as_u16(), body }
        } else {
            DeliveryError::Rejected { status: status.as_u16(), body }
        }
    }

    /// Connectivity problems and transient server responses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::Network(_) | DeliveryError::Timeout | DeliveryError::Server { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::capture::CaptureJob;
    use crate::models::flag::GeoFix;

    #[tokio::test]
    async fn test_location_payload_uses_fixed_decimals() {
        let fix = GeoFix { latitude: 28.6139391, longitude: 77.2090212 };
        let task = UploadTask::location("9", fix, None, 3);
        let payload = build_payload(&task).await.unwrap();

        assert_eq!(payload.endpoint, Endpoint::Location);
        assert_eq!(payload.field("type"), Some("location"));
        assert_eq!(payload.field("latitude"), Some("28.613939"));
        assert_eq!(payload.field("longitude"), Some("77.209021"));
    }

    #[tokio::test]
    async fn test_partial_capture_omits_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let back = dir.path().join("back.jpg");
        std::fs::write(&back, b"jpeg").unwrap();

        let mut job = CaptureJob::new("9");
        job.back_image_path = Some(back);
        let payload = build_payload(&UploadTask::from_capture(&job, 3)).await.unwrap();

        assert_eq!(payload.endpoint, Endpoint::TrackData);
        assert!(payload.has_image("back_image"));
        assert!(!payload.has_image("front_image"));
        assert_eq!(payload.field("latitude"), Some("0.0"));
        assert_eq!(payload.field("longitude"), Some("0.0"));
    }

    #[tokio::test]
    async fn test_pair_without_fix_goes_to_picture_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = CaptureJob::new("9");
        for name in ["front.jpg", "back.jpg"] {
            std::fs::write(dir.path().join(name), b"jpeg").unwrap();
        }
        job.front_image_path = Some(dir.path().join("front.jpg"));
        job.back_image_path = Some(dir.path().join("back.jpg"));

        let payload = build_payload(&UploadTask::from_capture(&job, 3)).await.unwrap();
        assert_eq!(payload.endpoint, Endpoint::CapturePicture);
        assert_eq!(payload.field("type"), Some("camera"));
        assert!(payload.has_image("front_image") && payload.has_image("back_image"));
    }

    #[tokio::test]
    async fn test_whole_coordinates_keep_decimal_point() {
        let dir = tempfile::tempdir().unwrap();
        let front = dir.path().join("front.jpg");
        std::fs::write(&front, b"jpeg").unwrap();

        let mut job = CaptureJob::new("9");
        job.front_image_path = Some(front);
        job.set_fix(GeoFix { latitude: 12.0, longitude: -3.25 });

        let payload = build_payload(&UploadTask::from_capture(&job, 3)).await.unwrap();
        assert_eq!(payload.field("latitude"), Some("12.0"));
        assert_eq!(payload.field("longitude"), Some("-3.25"));
    }

    #[tokio::test]
    async fn test_nothing_present_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = CaptureJob::new("9");
        job.front_image_path = Some(dir.path().join("gone.jpg"));
        let result = build_payload(&UploadTask::from_capture(&job, 3)).await;
        assert!(matches!(result, Err(DeliveryError::EmptyPayload)));
    }

    #[test]
    fn test_status_classification() {
        assert!(DeliveryError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(DeliveryError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(!DeliveryError::from_status(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_retryable());
        assert!(!DeliveryError::EmptyPayload.is_retryable());
    }
}
