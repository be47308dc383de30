use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::capture::Lens;

/// Still-capture parameters applied to every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StillSettings {
    /// Longest image edge in pixels.
    pub max_long_edge: u32,
    /// JPEG quality, 1-100.
    pub jpeg_quality: u8,
}

impl Default for StillSettings {
    fn default() -> Self {
        Self {
            max_long_edge: 1280,
            jpeg_quality: 80,
        }
    }
}

/// Exclusive binding of one lens, returned by [`CameraCapture::acquire`].
#[derive(Debug, PartialEq, Eq)]
pub struct CameraHandle {
    pub lens: Lens,
    pub session: Uuid,
}

/// Single-owner camera capability.
///
/// Only one handle may be bound at a time. Callers must `release` every
/// handle they acquire, whether or not the capture succeeded.
#[async_trait]
pub trait CameraCapture: Send + Sync {
    async fn acquire(&self, lens: Lens) -> Result<CameraHandle, CameraError>;

    /// Capture one frame and write it to `dest` as JPEG.
    async fn capture_frame(
        &self,
        handle: &CameraHandle,
        settings: &StillSettings,
        dest: &Path,
    ) -> Result<PathBuf, CameraError>;

    async fn release(&self, handle: CameraHandle);
}

/// Source of raw frames for a lens.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn grab(&self, lens: Lens) -> Result<DynamicImage, CameraError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindingState {
    Idle,
    Bound(Lens, Uuid),
    Capturing(Lens, Uuid),
}

/// [`CameraCapture`] over a [`FrameSource`], owning the idle/bound/capturing
/// state machine.
pub struct StillCamera<S> {
    source: S,
    state: Mutex<BindingState>,
}

impl<S: FrameSource> StillCamera<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Mutex::new(BindingState::Idle),
        }
    }

    fn transition(&self, from: BindingState, to: BindingState) -> Result<(), CameraError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(CameraError::InvalidState(format!("{:?}", *state)));
        }
        *state = to;
        Ok(())
    }
}

#[async_trait]
impl<S: FrameSource> CameraCapture for StillCamera<S> {
    async fn acquire(&self, lens: Lens) -> Result<CameraHandle, CameraError> {
        let session = Uuid::new_v4();
        self.transition(BindingState::Idle, BindingState::Bound(lens, session))
            .map_err(|_| CameraError::Busy)?;
        Ok(CameraHandle { lens, session })
    }

    async fn capture_frame(
        &self,
        handle: &CameraHandle,
        settings: &StillSettings,
        dest: &Path,
    ) -> Result<PathBuf, CameraError> {
        let bound = BindingState::Bound(handle.lens, handle.session);
        self.transition(bound, BindingState::Capturing(handle.lens, handle.session))?;

        let result = async {
            let frame = self.source.grab(handle.lens).await?;
            let encoded = encode_still(&frame, settings)?;
            tokio::fs::write(dest, encoded).await?;
            Ok::<_, CameraError>(dest.to_path_buf())
        }
        .await;

        // Back to bound whatever happened; release() is still required.
        let _ = self.transition(BindingState::Capturing(handle.lens, handle.session), bound);
        result
    }

    async fn release(&self, handle: CameraHandle) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            BindingState::Bound(_, session) | BindingState::Capturing(_, session)
                if session == handle.session =>
            {
                *state = BindingState::Idle;
            }
            _ => {}
        }
    }
}

/// Downscale so the long edge fits `max_long_edge`, then encode as JPEG.
pub fn encode_still(frame: &DynamicImage, settings: &StillSettings) -> Result<Vec<u8>, CameraError> {
    let (width, height) = (frame.width(), frame.height());
    let long_edge = width.max(height);

    let scaled = if long_edge > settings.max_long_edge {
        frame.resize(settings.max_long_edge, settings.max_long_edge, FilterType::Triangle)
    } else {
        frame.clone()
    };

    let rgb = scaled.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, settings.jpeg_quality.clamp(1, 100))
        .encode_image(&rgb)?;
    Ok(buf)
}

/// Frames published as snapshot files by the platform camera daemon.
pub struct FileFrameSource {
    back: PathBuf,
    front: PathBuf,
}

impl FileFrameSource {
    pub fn new(back: PathBuf, front: PathBuf) -> Self {
        Self { back, front }
    }
}

#[async_trait]
impl FrameSource for FileFrameSource {
    async fn grab(&self, lens: Lens) -> Result<DynamicImage, CameraError> {
        let path = match lens {
            Lens::Back => &self.back,
            Lens::Front => &self.front,
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(CameraError::PermissionDenied(path.display().to_string()));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CameraError::Unavailable(lens));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(image::load_from_memory(&bytes)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    #[error("Camera permission denied: {0}")]
    PermissionDenied(String),

    #[error("Camera is bound to another client")]
    Busy,

    #[error("No {0} camera available")]
    Unavailable(Lens),

    #[error("Camera in unexpected state: {0}")]
    InvalidState(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture timed out")]
    Timeout,
}

impl CameraError {
    /// Missing permission cannot be fixed by retrying another lens.
    pub fn is_permission(&self) -> bool {
        matches!(self, CameraError::PermissionDenied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, RgbImage};

    struct SolidSource;

    #[async_trait]
    impl FrameSource for SolidSource {
        async fn grab(&self, _lens: Lens) -> Result<DynamicImage, CameraError> {
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(1920, 1080, image::Rgb([40, 80, 120]))))
        }
    }

    #[test]
    fn test_encode_caps_long_edge() {
        let frame = DynamicImage::ImageRgb8(RgbImage::new(2560, 1440));
        let bytes = encode_still(&frame, &StillSettings::default()).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (1280, 720));
    }

    #[test]
    fn test_encode_keeps_small_frames() {
        let frame = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        let bytes = encode_still(&frame, &StillSettings::default()).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (640, 480));
    }

    #[tokio::test]
    async fn test_second_acquire_is_busy_until_release() {
        let camera = StillCamera::new(SolidSource);
        let handle = camera.acquire(Lens::Back).await.unwrap();
        assert!(matches!(camera.acquire(Lens::Front).await, Err(CameraError::Busy)));

        camera.release(handle).await;
        let front = camera.acquire(Lens::Front).await.unwrap();
        assert_eq!(front.lens, Lens::Front);
    }

    #[tokio::test]
    async fn test_capture_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("back.jpg");
        let camera = StillCamera::new(SolidSource);

        let handle = camera.acquire(Lens::Back).await.unwrap();
        let path = camera
            .capture_frame(&handle, &StillSettings::default(), &dest)
            .await
            .unwrap();
        camera.release(handle).await;

        let decoded = image::open(&path).unwrap();
        assert_eq!(decoded.dimensions(), (1280, 720));
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_capture() {
        let dir = tempfile::tempdir().unwrap();
        let camera = StillCamera::new(SolidSource);
        let handle = camera.acquire(Lens::Back).await.unwrap();
        let stale = CameraHandle { lens: Lens::Back, session: Uuid::new_v4() };

        let result = camera
            .capture_frame(&stale, &StillSettings::default(), &dir.path().join("x.jpg"))
            .await;
        assert!(matches!(result, Err(CameraError::InvalidState(_))));
        camera.release(handle).await;
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileFrameSource::new(dir.path().join("back.jpg"), dir.path().join("front.jpg"));
        assert!(matches!(source.grab(Lens::Front).await, Err(CameraError::Unavailable(Lens::Front))));
    }
}
