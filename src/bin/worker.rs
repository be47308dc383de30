use device_guard::{
    config::AgentConfig,
    db,
    services::{
        backend::HttpBackend,
        connectivity::Connectivity,
        queue::{AttemptOutcome, UploadQueue, UploadWorker},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second

/// Drains the upload queue without running the capture agent, e.g. after the
/// device regains connectivity while the agent is stopped. Tasks a crashed
/// agent left `running` are recovered by the agent's next start.
#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting upload queue drainer");

    // Load configuration
    let config = AgentConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Opening SQLite upload queue");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to open database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // No crash recovery here: the agent may be running against the same
    // database, and resetting its `running` rows would upload them twice.
    // Claims are atomic, so draining beside a live agent is safe.
    let queue = UploadQueue::new(db_pool, config.upload_max_retries);

    let backend = HttpBackend::new(&config.api_base_url, config.upload_timeout())
        .expect("Failed to initialize backend client");
    let connectivity = Connectivity::new(true);
    let _probe = connectivity.spawn_probe(
        backend.http().clone(),
        config.api_base_url.clone(),
        config.connectivity_probe_interval(),
    );

    let worker = UploadWorker::new(
        queue.clone(),
        Arc::new(backend),
        connectivity,
        config.worker_settings(),
    );

    tracing::info!("Drainer ready, starting upload loop");

    // Main processing loop
    loop {
        match worker.run_once().await {
            Ok(Some(outcome)) => {
                // Attempt recorded, continue immediately
                if let AttemptOutcome::Failed(failure) = outcome {
                    tracing::warn!(task_id = %failure.task_id, "Task left the queue undelivered");
                }
            }
            Ok(None) => {
                match queue.pending().await {
                    Ok(0) => {
                        tracing::info!("No pending uploads left, exiting");
                        break;
                    }
                    Ok(depth) => tracing::trace!(depth, "No task due yet, sleeping"),
                    Err(e) => tracing::error!(error = %e, "Failed to count pending uploads"),
                }
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing upload task, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}
