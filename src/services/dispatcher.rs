use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::Display;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::models::capture::{CaptureJob, CaptureStatus};
use crate::models::flag::{FlagKind, RemoteFlag};
use crate::services::capture::{CaptureCoordinator, CaptureError, JobControl, JobReport};
use crate::services::flag_store::RemoteFlagStore;
use crate::services::flag_watcher::FlagWatcher;

/// Where a command came from. Only remote-flag commands reset their flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CommandSource {
    RemoteFlag,
    LocalAuth,
    Api,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CaptureRequested { user_id: String, source: CommandSource },
    LocationRequested { user_id: String, source: CommandSource },
    Cancel { user_id: String },
}

impl Command {
    pub fn user_id(&self) -> &str {
        match self {
            Command::CaptureRequested { user_id, .. }
            | Command::LocationRequested { user_id, .. }
            | Command::Cancel { user_id } => user_id,
        }
    }
}

/// Result of dispatching one command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    CaptureAccepted { job_id: Uuid },
    /// A capture for this user is already active; the request was dropped.
    AlreadyActive { job_id: Option<Uuid> },
    LocationAccepted,
    /// The active capture will deliver a fix, so no separate fetch is needed.
    CoveredByCapture { job_id: Uuid },
    LocationInProgress,
    Cancelled { job_id: Uuid },
    /// The job already reached the camera and keeps running.
    CancelIgnored { job_id: Uuid, status: CaptureStatus },
    NothingToCancel,
    /// The coordinator refused the job for a reason other than dedupe.
    CaptureFailed { error: String },
}

struct ActiveCapture {
    control: JobControl,
    handle: Option<JoinHandle<JobReport>>,
}

#[derive(Default)]
struct UserSlot {
    capture: Option<ActiveCapture>,
    locating: Arc<AtomicBool>,
}

impl UserSlot {
    fn active_capture(&self) -> Option<&JobControl> {
        self.capture.as_ref().map(|c| &c.control).filter(|c| c.is_active())
    }
}

/// Per-user serialization point turning commands into capture and location
/// jobs.
pub struct CommandDispatcher {
    coordinator: Arc<CaptureCoordinator>,
    store: Arc<dyn RemoteFlagStore>,
    flag_reset_timeout: Duration,
    users: Mutex<HashMap<String, Arc<tokio::sync::Mutex<UserSlot>>>>,
}

impl CommandDispatcher {
    pub fn new(
        coordinator: Arc<CaptureCoordinator>,
        store: Arc<dyn RemoteFlagStore>,
        flag_reset_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            store,
            flag_reset_timeout,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, user_id: &str) -> Arc<tokio::sync::Mutex<UserSlot>> {
        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id.to_string())
            .or_default()
            .clone()
    }

    /// Hand `command` off to a task of its own and return immediately.
    /// Callers on shared delivery contexts use this instead of [`dispatch`].
    ///
    /// [`dispatch`]: CommandDispatcher::dispatch
    pub fn submit(self: &Arc<Self>, command: Command) -> JoinHandle<DispatchOutcome> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.dispatch(command).await })
    }

    /// Translate a remote flag change into a command. Only `true` triggers.
    pub fn on_flag(self: &Arc<Self>, flag: RemoteFlag) -> Option<JoinHandle<DispatchOutcome>> {
        if !flag.value {
            return None;
        }
        let user_id = flag.user_id;
        let source = CommandSource::RemoteFlag;
        let command = match flag.kind {
            FlagKind::CaptureRequired => Command::CaptureRequested { user_id, source },
            FlagKind::LocationRequired => Command::LocationRequested { user_id, source },
        };
        Some(self.submit(command))
    }

    /// Watch both command flags for `user_id`, feeding changes to this dispatcher.
    pub fn attach(self: &Arc<Self>, watcher: &FlagWatcher, user_id: &str) {
        for kind in FlagKind::ALL {
            let dispatcher = self.clone();
            watcher.watch(user_id, kind, move |flag| {
                dispatcher.on_flag(flag);
            });
        }
    }

    pub async fn dispatch(&self, command: Command) -> DispatchOutcome {
        let slot = self.slot(command.user_id());
        let mut slot = slot.lock().await;

        let (outcome, handled_flag) = match &command {
            Command::CaptureRequested { user_id, source } => (
                self.request_capture(&mut slot, user_id, *source),
                (*source == CommandSource::RemoteFlag).then_some(FlagKind::CaptureRequired),
            ),
            Command::LocationRequested { user_id, source } => (
                self.request_location(&slot, user_id, *source),
                (*source == CommandSource::RemoteFlag).then_some(FlagKind::LocationRequired),
            ),
            Command::Cancel { user_id } => (Self::cancel(&slot, user_id), None),
        };

        // The watcher only forwards transitions, so a flag left at `true`
        // would swallow every later request. Reset it whatever the outcome.
        if let Some(kind) = handled_flag {
            self.reset_flag(command.user_id(), kind).await;
        }
        drop(slot);
        outcome
    }

    fn request_capture(
        &self,
        slot: &mut UserSlot,
        user_id: &str,
        source: CommandSource,
    ) -> DispatchOutcome {
        if let Some(active) = slot.active_capture() {
            tracing::debug!(user_id, job_id = %active.job_id(), %source, "Capture already active, ignoring");
            return DispatchOutcome::AlreadyActive {
                job_id: Some(active.job_id()),
            };
        }

        let job = CaptureJob::new(user_id);
        let job_id = job.id;
        match self.coordinator.start(job) {
            Ok((control, handle)) => {
                slot.capture = Some(ActiveCapture {
                    control,
                    handle: Some(handle),
                });
                tracing::info!(user_id, job_id = %job_id, %source, "Capture command accepted");
                DispatchOutcome::CaptureAccepted { job_id }
            }
            Err(CaptureError::Busy(_)) => {
                tracing::debug!(user_id, %source, "Coordinator busy for user, ignoring");
                DispatchOutcome::AlreadyActive { job_id: None }
            }
            Err(e) => {
                tracing::error!(user_id, error = %e, "Failed to start capture job");
                DispatchOutcome::CaptureFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    fn request_location(&self, slot: &UserSlot, user_id: &str, source: CommandSource) -> DispatchOutcome {
        if let Some(active) = slot.active_capture() {
            tracing::debug!(user_id, job_id = %active.job_id(), "Location will come with active capture");
            DispatchOutcome::CoveredByCapture {
                job_id: active.job_id(),
            }
        } else if slot.locating.swap(true, Ordering::SeqCst) {
            tracing::debug!(user_id, %source, "Location fetch already in flight, ignoring");
            DispatchOutcome::LocationInProgress
        } else {
            let coordinator = self.coordinator.clone();
            let locating = slot.locating.clone();
            let user = user_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = coordinator.locate(&user).await {
                    tracing::error!(user_id = %user, error = %e, "Location request failed");
                }
                locating.store(false, Ordering::SeqCst);
            });
            tracing::info!(user_id, %source, "Location command accepted");
            DispatchOutcome::LocationAccepted
        }
    }

    fn cancel(slot: &UserSlot, user_id: &str) -> DispatchOutcome {
        let Some(active) = slot.active_capture() else {
            return DispatchOutcome::NothingToCancel;
        };
        let job_id = active.job_id();
        if active.cancel() {
            tracing::info!(user_id, job_id = %job_id, "Pending capture cancelled");
            DispatchOutcome::Cancelled { job_id }
        } else {
            let status = active.status();
            tracing::info!(user_id, job_id = %job_id, %status, "Capture already underway, cancel ignored");
            DispatchOutcome::CancelIgnored { job_id, status }
        }
    }

    /// Write `false` back to the originating flag, bounded so a stuck store
    /// cannot hold the user's slot.
    async fn reset_flag(&self, user_id: &str, kind: FlagKind) {
        let path = kind.path(user_id);
        match timeout(self.flag_reset_timeout, self.store.set(&path, json!(false))).await {
            Ok(Ok(())) => tracing::debug!(user_id, %kind, "Remote flag reset"),
            Ok(Err(e)) => tracing::warn!(user_id, %kind, error = %e, "Failed to reset remote flag"),
            Err(_) => tracing::warn!(user_id, %kind, "Timed out resetting remote flag"),
        }
    }

    /// Take the join handle of the user's most recent capture job, if any.
    pub async fn take_job(&self, user_id: &str) -> Option<JoinHandle<JobReport>> {
        let slot = self.slot(user_id);
        let mut slot = slot.lock().await;
        slot.capture.as_mut().and_then(|c| c.handle.take())
    }
}
