//! In-crate fakes for the hardware and network collaborators, plus a
//! pipeline builder wiring them to a real SQLite queue.

#![allow(dead_code)]

use async_trait::async_trait;
use device_guard::{
    db,
    models::capture::Lens,
    models::flag::GeoFix,
    services::{
        backend::{DeliveryError, UploadBackend, UploadPayload},
        backoff::Backoff,
        camera::{CameraCapture, CameraError, CameraHandle, StillSettings},
        capture::{CaptureCoordinator, CaptureSettings},
        connectivity::Connectivity,
        dispatcher::CommandDispatcher,
        flag_store::MemoryFlagStore,
        location::{LocationError, LocationProvider},
        queue::{UploadQueue, UploadWorker, WorkerSettings},
    },
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::fixtures::STILL_BYTES;

/// How the fake camera behaves for one lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensBehavior {
    Succeed,
    Fail,
    PermissionDenied,
    /// Never finishes `capture_frame`.
    Hang,
}

/// Camera fake that records every call and can hold captures at a gate.
#[derive(Default)]
pub struct FakeCamera {
    behavior: Mutex<HashMap<Lens, LensBehavior>>,
    bound: AtomicUsize,
    max_bound: AtomicUsize,
    events: Mutex<Vec<String>>,
    gated: AtomicBool,
    gate: Notify,
    entered: Notify,
}

impl FakeCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, lens: Lens, behavior: LensBehavior) {
        self.behavior.lock().unwrap().insert(lens, behavior);
    }

    fn behavior(&self, lens: Lens) -> LensBehavior {
        *self.behavior.lock().unwrap().get(&lens).unwrap_or(&LensBehavior::Succeed)
    }

    /// Hold every capture until [`open_gate`](Self::open_gate).
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }

    /// Resolve once a capture has entered `capture_frame`.
    pub async fn wait_capturing(&self) {
        self.entered.notified().await;
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.events().iter().filter(|e| e.starts_with("acquire")).count()
    }

    pub fn max_concurrently_bound(&self) -> usize {
        self.max_bound.load(Ordering::SeqCst)
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl CameraCapture for FakeCamera {
    async fn acquire(&self, lens: Lens) -> Result<CameraHandle, CameraError> {
        self.record(format!("acquire {lens}"));
        if self.behavior(lens) == LensBehavior::PermissionDenied {
            return Err(CameraError::PermissionDenied("camera".to_string()));
        }
        let bound = self.bound.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_bound.fetch_max(bound, Ordering::SeqCst);
        Ok(CameraHandle {
            lens,
            session: Uuid::new_v4(),
        })
    }

    async fn capture_frame(
        &self,
        handle: &CameraHandle,
        _settings: &StillSettings,
        dest: &Path,
    ) -> Result<PathBuf, CameraError> {
        self.record(format!("capture {}", handle.lens));
        self.entered.notify_one();
        if self.gated.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        if self.behavior(handle.lens) == LensBehavior::Hang {
            std::future::pending::<()>().await;
        }
        match self.behavior(handle.lens) {
            LensBehavior::Succeed => {
                tokio::fs::write(dest, STILL_BYTES).await?;
                Ok(dest.to_path_buf())
            }
            _ => Err(CameraError::Unavailable(handle.lens)),
        }
    }

    async fn release(&self, handle: CameraHandle) {
        self.bound.fetch_sub(1, Ordering::SeqCst);
        self.record(format!("release {}", handle.lens));
    }
}

/// Location fake returning a fixed fix, `NoFix` or `PermissionDenied`.
pub struct FakeLocation {
    fix: Mutex<Option<GeoFix>>,
    denied: AtomicBool,
}

impl FakeLocation {
    pub fn new(fix: Option<GeoFix>) -> Self {
        Self {
            fix: Mutex::new(fix),
            denied: AtomicBool::new(false),
        }
    }

    pub fn set(&self, fix: Option<GeoFix>) {
        *self.fix.lock().unwrap() = fix;
    }

    pub fn deny(&self) {
        self.denied.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn current_fix(&self) -> Result<GeoFix, LocationError> {
        if self.denied.load(Ordering::SeqCst) {
            return Err(LocationError::PermissionDenied);
        }
        (*self.fix.lock().unwrap()).ok_or(LocationError::NoFix)
    }
}

/// Backend fake: fails with a transient error while `reachable` is false,
/// or rejects permanently while `reject` is set.
#[derive(Default)]
pub struct FakeBackend {
    reachable: AtomicBool,
    reject: AtomicBool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<UploadPayload>>,
}

impl FakeBackend {
    pub fn reachable() -> Self {
        let backend = Self::default();
        backend.reachable.store(true, Ordering::SeqCst);
        backend
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<UploadPayload> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadBackend for FakeBackend {
    async fn deliver(&self, payload: UploadPayload) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(DeliveryError::Rejected {
                status: 422,
                body: "invalid user".to_string(),
            });
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(DeliveryError::Timeout);
        }
        self.delivered.lock().unwrap().push(payload);
        Ok(())
    }
}

/// Open a fresh migrated SQLite database inside `dir`.
pub async fn open_pool(dir: &Path) -> SqlitePool {
    let url = format!("sqlite://{}", dir.join("queue.db").display());
    let pool = db::init_pool(&url).await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    pool
}

/// Worker settings with millisecond backoff so retry tests run quickly.
pub fn fast_worker_settings() -> WorkerSettings {
    WorkerSettings {
        backoff: Backoff::new(Duration::from_millis(20), Duration::from_millis(500)),
        attempt_timeout: Duration::from_secs(2),
        concurrency: 2,
        idle_poll: Duration::from_millis(50),
    }
}

/// Everything a pipeline test needs, backed by fakes and a temp directory.
pub struct Pipeline {
    pub dir: TempDir,
    pub camera: Arc<FakeCamera>,
    pub location: Arc<FakeLocation>,
    pub store: Arc<MemoryFlagStore>,
    pub queue: UploadQueue,
    pub coordinator: Arc<CaptureCoordinator>,
    pub dispatcher: Arc<CommandDispatcher>,
}

impl Pipeline {
    pub async fn new(fix: Option<GeoFix>, max_retries: i32) -> Self {
        Self::with_step_timeout(fix, max_retries, Duration::from_secs(2)).await
    }

    pub async fn with_step_timeout(fix: Option<GeoFix>, max_retries: i32, step_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path()).await;
        let queue = UploadQueue::new(pool, max_retries);

        let camera = Arc::new(FakeCamera::new());
        let location = Arc::new(FakeLocation::new(fix));
        let store = Arc::new(MemoryFlagStore::new());

        let coordinator = Arc::new(CaptureCoordinator::new(
            camera.clone(),
            location.clone(),
            store.clone(),
            queue.clone(),
            CaptureSettings {
                capture_dir: dir.path().join("captures"),
                still: StillSettings::default(),
                step_timeout,
                location_timeout: Duration::from_secs(2),
            },
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            coordinator.clone(),
            store.clone(),
            Duration::from_secs(1),
        ));

        Self {
            dir,
            camera,
            location,
            store,
            queue,
            coordinator,
            dispatcher,
        }
    }

    pub fn worker(&self, backend: Arc<FakeBackend>, connectivity: Connectivity) -> UploadWorker {
        UploadWorker::new(self.queue.clone(), backend, connectivity, fast_worker_settings())
    }

    pub fn capture_dir(&self) -> PathBuf {
        self.dir.path().join("captures")
    }

    /// Files currently left in the capture directory.
    pub fn capture_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.capture_dir()) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}
