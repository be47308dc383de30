use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::Display;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::models::capture::{CaptureJob, CaptureStatus, Lens};
use crate::models::flag::{location_path, GeoFix};
use crate::models::task::UploadTask;
use crate::services::camera::{CameraCapture, CameraError, StillSettings};
use crate::services::flag_store::RemoteFlagStore;
use crate::services::location::{LocationError, LocationProvider};
use crate::services::queue::{QueueError, UploadQueue};

/// Timeouts and output settings for the capture sequence.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub capture_dir: PathBuf,
    pub still: StillSettings,
    pub step_timeout: Duration,
    pub location_timeout: Duration,
}

#[derive(Debug)]
struct ControlState {
    status: CaptureStatus,
    cancelled: bool,
}

/// Shared handle on a running job, used to observe progress and cancel it
/// before it reaches the camera.
#[derive(Clone)]
pub struct JobControl {
    job_id: Uuid,
    state: Arc<Mutex<ControlState>>,
    cancel: Arc<Notify>,
}

impl JobControl {
    fn new(job_id: Uuid) -> Self {
        Self {
            job_id,
            state: Arc::new(Mutex::new(ControlState {
                status: CaptureStatus::Pending,
                cancelled: false,
            })),
            cancel: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn status(&self) -> CaptureStatus {
        self.lock().status
    }

    /// True while the job can still produce evidence.
    pub fn is_active(&self) -> bool {
        let state = self.lock();
        !state.cancelled && !state.status.is_terminal()
    }

    /// Cancel the job if it has not started hardware acquisition.
    /// Returns false once the camera sequence is underway.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.status.has_started_hardware() {
            return false;
        }
        state.cancelled = true;
        drop(state);
        self.cancel.notify_one();
        true
    }

    /// Leave `Pending` for the first hardware state unless cancelled first.
    fn begin(&self) -> bool {
        let mut state = self.lock();
        if state.cancelled {
            return false;
        }
        state.status = CaptureStatus::CapturingBack;
        true
    }

    fn set_status(&self, status: CaptureStatus) {
        self.lock().status = status;
    }
}

/// What became of a finished capture job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Cancelled before touching hardware.
    Cancelled,
    /// Images (and maybe a fix) queued for upload.
    Enqueued { task_id: Uuid },
    /// No image succeeded but a fix did; delivered as a location payload.
    LocationOnly { task_id: Uuid },
    /// Nothing obtained; never reaches the queue.
    Discarded,
    /// Evidence obtained but could not be persisted.
    EnqueueFailed(String),
}

/// A capability the platform refused while the job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeniedPermission {
    Camera,
    Location,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: CaptureJob,
    pub outcome: JobOutcome,
    /// Empty unless a permission failure cut the job short.
    pub denied: Vec<DeniedPermission>,
}

/// Removes the dedupe entry for a job when its task ends, however it ends.
struct InFlightGuard {
    registry: Arc<Mutex<HashMap<String, JobControl>>>,
    user_id: String,
    job_id: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if registry.get(&self.user_id).map(|c| c.job_id) == Some(self.job_id) {
            registry.remove(&self.user_id);
        }
    }
}

/// Runs the exclusive back → front → location capture sequence and hands
/// the result to the upload queue.
pub struct CaptureCoordinator {
    camera: Arc<dyn CameraCapture>,
    location: Arc<dyn LocationProvider>,
    store: Arc<dyn RemoteFlagStore>,
    queue: UploadQueue,
    settings: CaptureSettings,
    hardware: Arc<tokio::sync::Mutex<()>>,
    in_flight: Arc<Mutex<HashMap<String, JobControl>>>,
}

impl CaptureCoordinator {
    pub fn new(
        camera: Arc<dyn CameraCapture>,
        location: Arc<dyn LocationProvider>,
        store: Arc<dyn RemoteFlagStore>,
        queue: UploadQueue,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            camera,
            location,
            store,
            queue,
            settings,
            hardware: Arc::new(tokio::sync::Mutex::new(())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a capture job for `user_id` is currently active.
    pub fn is_running(&self, user_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .is_some_and(|c| c.is_active())
    }

    /// Accept `job` and run it in the background.
    ///
    /// Rejected synchronously with [`CaptureError::Busy`] if the user already
    /// has an active job.
    pub fn start(
        self: &Arc<Self>,
        job: CaptureJob,
    ) -> Result<(JobControl, JoinHandle<JobReport>), CaptureError> {
        let control = JobControl::new(job.id);
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if in_flight.get(&job.user_id).is_some_and(|c| c.is_active()) {
                return Err(CaptureError::Busy(job.user_id));
            }
            in_flight.insert(job.user_id.clone(), control.clone());
        }

        let guard = InFlightGuard {
            registry: self.in_flight.clone(),
            user_id: job.user_id.clone(),
            job_id: job.id,
        };
        tracing::info!(job_id = %job.id, user_id = %job.user_id, "Capture job accepted");

        let coordinator = self.clone();
        let task_control = control.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            coordinator.run(job, task_control).await
        });
        Ok((control, handle))
    }

    async fn run(&self, mut job: CaptureJob, control: JobControl) -> JobReport {
        // Pending until the hardware is ours; a cancel here drops the job.
        let hardware = tokio::select! {
            guard = self.hardware.clone().lock_owned() => guard,
            _ = control.cancel.notified() => {
                return self.cancelled(job);
            }
        };
        if !control.begin() {
            return self.cancelled(job);
        }
        metrics::counter!("capture_jobs_total").increment(1);

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.capture_dir).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to create capture directory");
        }

        let location = self.location.clone();
        let location_timeout = self.settings.location_timeout;
        let fix_task = tokio::spawn(async move {
            match timeout(location_timeout, location.current_fix()).await {
                Ok(result) => result,
                Err(_) => Err(LocationError::Timeout),
            }
        });

        let mut denied = Vec::new();
        for lens in [Lens::Back, Lens::Front] {
            let status = match lens {
                Lens::Back => CaptureStatus::CapturingBack,
                Lens::Front => CaptureStatus::CapturingFront,
            };
            control.set_status(status);
            job.status = status;

            match self.capture_step(lens).await {
                Ok(path) => {
                    tracing::info!(job_id = %job.id, %lens, path = %path.display(), "Captured still");
                    job.set_image(lens, path);
                }
                Err(e) if e.is_permission() => {
                    tracing::warn!(job_id = %job.id, %lens, error = %e, "Camera permission missing, skipping remaining steps");
                    denied.push(DeniedPermission::Camera);
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, %lens, error = %e, "Capture step failed");
                }
            }
        }
        drop(hardware);

        control.set_status(CaptureStatus::LocationFetch);
        job.status = CaptureStatus::LocationFetch;
        let fix = match fix_task.await {
            Ok(Ok(fix)) => Some(fix),
            Ok(Err(LocationError::PermissionDenied)) => {
                tracing::warn!(job_id = %job.id, "Location permission missing");
                denied.push(DeniedPermission::Location);
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %job.id, error = %e, "Location fetch failed");
                None
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Location task aborted");
                None
            }
        };
        if let Some(fix) = fix {
            job.set_fix(fix);
            self.publish_fix(&job.user_id, fix).await;
        }

        let outcome = self.finalize(&job, fix).await;
        let status = match outcome {
            JobOutcome::Enqueued { .. } | JobOutcome::LocationOnly { .. } => CaptureStatus::Ready,
            _ => CaptureStatus::Failed,
        };
        control.set_status(status);
        job.status = status;

        JobReport {
            job,
            outcome,
            denied,
        }
    }

    fn cancelled(&self, job: CaptureJob) -> JobReport {
        tracing::info!(job_id = %job.id, user_id = %job.user_id, "Capture job cancelled before start");
        JobReport {
            job,
            outcome: JobOutcome::Cancelled,
            denied: Vec::new(),
        }
    }

    /// One bounded acquire → capture → release cycle. The handle is released
    /// whether or not the capture succeeded.
    async fn capture_step(&self, lens: Lens) -> Result<PathBuf, CameraError> {
        let step = self.settings.step_timeout;
        let handle = match timeout(step, self.camera.acquire(lens)).await {
            Ok(handle) => handle?,
            Err(_) => return Err(CameraError::Timeout),
        };

        let dest = self.settings.capture_dir.join(still_file_name(lens));
        let result = match timeout(
            step,
            self.camera.capture_frame(&handle, &self.settings.still, &dest),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CameraError::Timeout),
        };
        self.camera.release(handle).await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&dest).await;
        }
        result
    }

    async fn finalize(&self, job: &CaptureJob, fix: Option<GeoFix>) -> JobOutcome {
        let enqueued = if job.has_images() {
            self.queue
                .enqueue_job(job)
                .await
                .map(|task_id| JobOutcome::Enqueued { task_id })
        } else if let Some(fix) = fix {
            let task = UploadTask::location(&job.user_id, fix, Some(job.id), self.queue.max_retries());
            self.queue
                .enqueue(&task)
                .await
                .map(|_| JobOutcome::LocationOnly { task_id: task.id })
        } else {
            metrics::counter!("capture_jobs_discarded").increment(1);
            tracing::warn!(job_id = %job.id, user_id = %job.user_id, "No evidence obtained, discarding job");
            return JobOutcome::Discarded;
        };

        match enqueued {
            Ok(outcome) => {
                tracing::info!(job_id = %job.id, user_id = %job.user_id, ?outcome, "Capture job finished");
                outcome
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue capture result");
                for path in job.front_image_path.iter().chain(job.back_image_path.iter()) {
                    let _ = tokio::fs::remove_file(path).await;
                }
                JobOutcome::EnqueueFailed(e.to_string())
            }
        }
    }

    /// Write the latest fix back to the remote store.
    async fn publish_fix(&self, user_id: &str, fix: GeoFix) {
        let value = json!({ "latitude": fix.latitude, "longitude": fix.longitude });
        let path = location_path(user_id);
        match timeout(self.settings.step_timeout, self.store.set(&path, value)).await {
            Ok(Ok(())) => tracing::debug!(user_id, "Published location fix"),
            Ok(Err(e)) => tracing::warn!(user_id, error = %e, "Failed to publish location fix"),
            Err(_) => tracing::warn!(user_id, "Timed out publishing location fix"),
        }
    }

    /// Location-only request: fetch one fix, publish it and queue it for
    /// delivery without touching the camera.
    pub async fn locate(&self, user_id: &str) -> Result<Option<Uuid>, CaptureError> {
        let fix = match timeout(self.settings.location_timeout, self.location.current_fix()).await {
            Ok(Ok(fix)) => fix,
            Ok(Err(e)) => {
                tracing::warn!(user_id, error = %e, "Location fetch failed");
                return Ok(None);
            }
            Err(_) => {
                tracing::warn!(user_id, "Location fetch timed out");
                return Ok(None);
            }
        };

        self.publish_fix(user_id, fix).await;
        let task_id = self.queue.enqueue_location(user_id, fix).await?;
        Ok(Some(task_id))
    }
}

/// Unique temp file name for one still.
fn still_file_name(lens: Lens) -> String {
    format!(
        "IMG_{}_{}_{}.jpg",
        Utc::now().format("%Y%m%d_%H%M%S"),
        lens,
        Uuid::new_v4().simple()
    )
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture already running for user {0}")]
    Busy(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}
