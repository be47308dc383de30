use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::db::queries;
use crate::models::capture::CaptureJob;
use crate::models::flag::GeoFix;
use crate::models::task::{TerminalFailure, UploadTask};
use crate::services::backend::{build_payload, DeliveryError, UploadBackend};
use crate::services::backoff::Backoff;
use crate::services::connectivity::Connectivity;

/// Attempts at returning a task to `pending` after its outcome failed to record.
const RELEASE_ATTEMPTS: u32 = 3;

/// SQLite-backed durable upload queue.
#[derive(Clone)]
pub struct UploadQueue {
    pool: SqlitePool,
    notify: Arc<Notify>,
    max_retries: i32,
}

impl UploadQueue {
    pub fn new(pool: SqlitePool, max_retries: i32) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
            max_retries,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Return tasks interrupted by a crash to the pending state.
    pub async fn recover(&self) -> Result<u64, QueueError> {
        let recovered = queries::reset_running_tasks(&self.pool).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered upload tasks interrupted by restart");
        }
        Ok(recovered)
    }

    /// Enqueue a task. Returns false when a task with the same id is already queued.
    pub async fn enqueue(&self, task: &UploadTask) -> Result<bool, QueueError> {
        let inserted = queries::insert_task(&self.pool, task).await?;
        if inserted {
            metrics::counter!("upload_tasks_enqueued").increment(1);
            tracing::info!(
                task_id = %task.id,
                kind = %task.kind,
                user_id = %task.user_id,
                "Upload task enqueued"
            );
            self.notify.notify_one();
        } else {
            tracing::debug!(task_id = %task.id, "Upload task already queued");
        }
        Ok(inserted)
    }

    /// Enqueue the result of a finished capture job under the job's id.
    pub async fn enqueue_job(&self, job: &CaptureJob) -> Result<Uuid, QueueError> {
        let task = UploadTask::from_capture(job, self.max_retries);
        self.enqueue(&task).await?;
        Ok(task.id)
    }

    pub async fn enqueue_capture(
        &self,
        user_id: &str,
        front: Option<PathBuf>,
        back: Option<PathBuf>,
    ) -> Result<Uuid, QueueError> {
        if front.is_none() && back.is_none() {
            return Err(QueueError::NothingToUpload);
        }
        let task = UploadTask::capture_files(user_id, front, back, self.max_retries);
        self.enqueue(&task).await?;
        Ok(task.id)
    }

    pub async fn enqueue_location(&self, user_id: &str, fix: GeoFix) -> Result<Uuid, QueueError> {
        let task = UploadTask::location(user_id, fix, None, self.max_retries);
        self.enqueue(&task).await?;
        Ok(task.id)
    }

    pub async fn get(&self, task_id: Uuid) -> Result<Option<UploadTask>, QueueError> {
        Ok(queries::get_task(&self.pool, task_id).await?)
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<UploadTask>, QueueError> {
        Ok(queries::list_tasks(&self.pool, limit).await?)
    }

    /// Current number of non-terminal tasks.
    pub async fn depth(&self) -> Result<i64, QueueError> {
        let depth = queries::count_tasks(&self.pool).await?;
        metrics::gauge!("upload_queue_depth").set(depth as f64);
        Ok(depth)
    }

    /// Tasks still waiting to be claimed, excluding ones mid-attempt.
    pub async fn pending(&self) -> Result<i64, QueueError> {
        Ok(queries::count_pending_tasks(&self.pool).await?)
    }

    /// Check SQLite connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete files in `dir` that no queued task references.
    ///
    /// Only safe while no capture is in progress, i.e. at start-up.
    pub async fn sweep_orphans(&self, dir: &Path) -> Result<usize, QueueError> {
        let referenced: HashSet<PathBuf> = self
            .list(i64::MAX)
            .await?
            .iter()
            .flat_map(|t| t.artifacts().cloned().collect::<Vec<_>>())
            .collect();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && !referenced.contains(&path) {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, dir = %dir.display(), "Removed orphaned capture files");
        }
        Ok(removed)
    }

    async fn claim(&self, online: bool) -> Result<Option<UploadTask>, QueueError> {
        Ok(queries::claim_due_task(&self.pool, Utc::now(), online).await?)
    }

    async fn finish(&self, task: &UploadTask) -> Result<(), QueueError> {
        queries::delete_task(&self.pool, task.id).await?;
        remove_artifacts(task).await;
        Ok(())
    }

    /// Time until the earliest pending task is due, capped at `cap`.
    async fn idle_delay(&self, cap: Duration) -> Duration {
        match queries::next_due_at(&self.pool).await {
            Ok(Some(due)) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(cap),
            _ => cap,
        }
    }
}

async fn remove_artifacts(task: &UploadTask) {
    for path in task.artifacts() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(task_id = %task.id, path = %path.display(), "Removed capture file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(task_id = %task.id, path = %path.display(), error = %e, "Failed to remove capture file")
            }
        }
    }
}

/// Tunables for the upload worker pool.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub backoff: Backoff,
    pub attempt_timeout: Duration,
    pub concurrency: usize,
    pub idle_poll: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(1800)),
            attempt_timeout: Duration::from_secs(60),
            concurrency: 4,
            idle_poll: Duration::from_secs(5),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Delivered,
    Rescheduled { retry_count: i32, delay: Duration },
    Failed(TerminalFailure),
}

/// Executes queued tasks against the backend.
#[derive(Clone)]
pub struct UploadWorker {
    queue: UploadQueue,
    backend: Arc<dyn UploadBackend>,
    connectivity: Connectivity,
    settings: WorkerSettings,
    failures: Option<mpsc::UnboundedSender<TerminalFailure>>,
}

impl UploadWorker {
    pub fn new(
        queue: UploadQueue,
        backend: Arc<dyn UploadBackend>,
        connectivity: Connectivity,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            backend,
            connectivity,
            settings,
            failures: None,
        }
    }

    /// Report terminal failures on `tx` in addition to the error log.
    pub fn with_failure_reports(mut self, tx: mpsc::UnboundedSender<TerminalFailure>) -> Self {
        self.failures = Some(tx);
        self
    }

    /// Claim and execute one due task inline.
    /// Returns Ok(None) if no task was runnable.
    pub async fn run_once(&self) -> Result<Option<AttemptOutcome>, QueueError> {
        match self.queue.claim(self.connectivity.is_online()).await? {
            Some(task) => Ok(Some(self.process(task).await?)),
            None => Ok(None),
        }
    }

    /// Run the worker pool until `shutdown` flips to true, then wait for
    /// in-flight attempts.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut in_flight = JoinSet::new();
        let mut network = self.connectivity.subscribe();

        tracing::info!(concurrency = self.settings.concurrency, "Upload worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Upload attempt panicked");
                }
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => continue,
            };

            let online = self.connectivity.is_online();
            match self.queue.claim(online).await {
                Ok(Some(task)) => {
                    let worker = self.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        // Errors are logged and the task released inside process.
                        let _ = worker.process(task).await;
                    });
                }
                Ok(None) => {
                    drop(permit);
                    // Offline, due tasks stay unclaimable until the network returns.
                    let delay = if online {
                        self.queue.idle_delay(self.settings.idle_poll).await
                    } else {
                        self.settings.idle_poll
                    };
                    tokio::select! {
                        _ = self.queue.notify.notified() => {}
                        _ = network.changed() => {}
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to claim upload task, will retry");
                    sleep(self.settings.idle_poll).await;
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Upload worker stopping");
        while in_flight.join_next().await.is_some() {}
    }

    async fn attempt(&self, task: &UploadTask) -> Result<(), DeliveryError> {
        let delivery = async {
            let payload = build_payload(task).await?;
            self.backend.deliver(payload).await
        };
        match timeout(self.settings.attempt_timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Execute one claimed task and record the outcome.
    async fn process(&self, task: UploadTask) -> Result<AttemptOutcome, QueueError> {
        tracing::info!(
            task_id = %task.id,
            kind = %task.kind,
            user_id = %task.user_id,
            retry_count = task.retry_count,
            "Processing upload task"
        );

        let start = std::time::Instant::now();
        let result = self.attempt(&task).await;
        metrics::histogram!("upload_attempt_seconds").record(start.elapsed().as_secs_f64());

        match self.record(&task, result).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to record upload outcome, releasing task");
                self.release(&task).await;
                Err(e)
            }
        }
    }

    /// Put a task whose outcome could not be recorded back to `pending` so
    /// this process retries it instead of leaving it `running` until restart.
    async fn release(&self, task: &UploadTask) {
        let delay = self.settings.backoff.delay(task.retry_count as u32 + 1);
        for attempt in 1..=RELEASE_ATTEMPTS {
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
            match queries::release_task(&self.queue.pool, task.id, next_attempt_at).await {
                Ok(released) => {
                    if released {
                        self.queue.notify.notify_one();
                        tracing::warn!(task_id = %task.id, delay_ms = delay.as_millis() as u64, "Upload task released for retry");
                    }
                    return;
                }
                Err(e) if attempt < RELEASE_ATTEMPTS => {
                    tracing::warn!(task_id = %task.id, attempt, error = %e, "Failed to release upload task");
                    sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Upload task stuck in running until restart");
                }
            }
        }
    }

    /// Record the outcome of one attempt: delete, reschedule or fail the task.
    async fn record(
        &self,
        task: &UploadTask,
        result: Result<(), DeliveryError>,
    ) -> Result<AttemptOutcome, QueueError> {
        match result {
            Ok(()) => {
                self.queue.finish(task).await?;
                metrics::counter!("upload_tasks_completed").increment(1);
                tracing::info!(task_id = %task.id, attempts = task.retry_count + 1, "Upload delivered");
                Ok(AttemptOutcome::Delivered)
            }
            Err(e) if e.is_retryable() && task.retry_count < task.max_retries => {
                let retry_count = task.retry_count + 1;
                let delay = self.settings.backoff.delay(retry_count as u32);
                let next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
                queries::reschedule_task(
                    &self.queue.pool,
                    task.id,
                    retry_count,
                    next_attempt_at,
                    &e.to_string(),
                )
                .await?;
                self.queue.notify.notify_one();

                metrics::counter!("upload_retries_total").increment(1);
                tracing::warn!(
                    task_id = %task.id,
                    retry_count = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Upload failed, rescheduled"
                );
                Ok(AttemptOutcome::Rescheduled { retry_count, delay })
            }
            Err(e) => {
                let failure = TerminalFailure {
                    task_id: task.id,
                    kind: task.kind,
                    user_id: task.user_id.clone(),
                    attempts: task.retry_count + 1,
                    error: e.to_string(),
                    failed_at: Utc::now(),
                };
                self.queue.finish(task).await?;

                metrics::counter!("upload_tasks_failed").increment(1);
                tracing::error!(
                    task_id = %task.id,
                    kind = %task.kind,
                    user_id = %task.user_id,
                    attempts = failure.attempts,
                    error = %e,
                    "Upload permanently failed"
                );
                if let Some(tx) = &self.failures {
                    let _ = tx.send(failure.clone());
                }
                Ok(AttemptOutcome::Failed(failure))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Capture upload needs at least one image")]
    NothingToUpload,
}
