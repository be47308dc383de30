use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use device_guard::{
    app_state::AppState,
    config::AgentConfig,
    db,
    models::session::LoginRequest,
    routes::{self, metrics::MetricsState},
    services::{
        auth_monitor::FailedAuthMonitor,
        backend::HttpBackend,
        backoff::Backoff,
        camera::{FileFrameSource, StillCamera},
        capture::CaptureCoordinator,
        connectivity::Connectivity,
        dispatcher::{Command, CommandDispatcher, CommandSource},
        flag_store::{MemoryFlagStore, RedisFlagStore, RemoteFlagStore},
        flag_watcher::FlagWatcher,
        location::FixFileLocation,
        login::LoginClient,
        queue::{UploadQueue, UploadWorker},
        session::SessionStore,
    },
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AgentConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing device-guard agent");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("capture_jobs_total", "Capture jobs that reached the camera");
    metrics::describe_counter!(
        "capture_jobs_discarded",
        "Capture jobs that produced no evidence"
    );
    metrics::describe_counter!("upload_tasks_enqueued", "Upload tasks added to the queue");
    metrics::describe_counter!("upload_tasks_completed", "Upload tasks delivered");
    metrics::describe_counter!(
        "upload_tasks_failed",
        "Upload tasks that failed permanently"
    );
    metrics::describe_counter!("upload_retries_total", "Upload attempts rescheduled");
    metrics::describe_histogram!("upload_attempt_seconds", "Duration of one upload attempt");
    metrics::describe_gauge!("upload_queue_depth", "Upload tasks waiting or running");

    // Initialize the upload queue database
    tracing::info!(database_url = %config.database_url, "Opening SQLite upload queue");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to open database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let queue = UploadQueue::new(db_pool, config.upload_max_retries);
    queue
        .recover()
        .await
        .expect("Failed to recover interrupted upload tasks");
    if let Err(e) = queue.sweep_orphans(&config.capture_dir).await {
        tracing::warn!(error = %e, "Failed to sweep orphaned capture files");
    }

    // Resolve the user the agent acts for
    let sessions = SessionStore::new(config.session_path.clone());
    let session_user = resolve_session_user(&config, &sessions).await;

    // Initialize remote flag store
    let flag_store: Arc<dyn RemoteFlagStore> = match &config.redis_url {
        Some(url) => {
            tracing::info!("Connecting to Redis flag store");
            Arc::new(RedisFlagStore::new(url).expect("Failed to initialize Redis flag store"))
        }
        None => {
            tracing::warn!("REDIS_URL not set, remote flags are local to this process");
            Arc::new(MemoryFlagStore::new())
        }
    };

    // Hardware collaborators
    let camera = Arc::new(StillCamera::new(FileFrameSource::new(
        config.camera_back_source.clone(),
        config.camera_front_source.clone(),
    )));
    let location = Arc::new(
        FixFileLocation::new(config.location_fix_path.clone())
            .with_max_age(chrono::Duration::minutes(10)),
    );

    // Upload worker pool
    let backend = HttpBackend::new(&config.api_base_url, config.upload_timeout())
        .expect("Failed to initialize backend client");
    let connectivity = Connectivity::new(true);
    let _probe = connectivity.spawn_probe(
        backend.http().clone(),
        config.api_base_url.clone(),
        config.connectivity_probe_interval(),
    );

    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = UploadWorker::new(
        queue.clone(),
        Arc::new(backend),
        connectivity.clone(),
        config.worker_settings(),
    )
    .with_failure_reports(failure_tx);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    tokio::spawn(async move {
        while let Some(failure) = failure_rx.recv().await {
            tracing::warn!(
                target: "device_guard::operator",
                task_id = %failure.task_id,
                user_id = %failure.user_id,
                attempts = failure.attempts,
                error = %failure.error,
                "Evidence delivery abandoned"
            );
        }
    });

    // Capture pipeline
    let coordinator = Arc::new(CaptureCoordinator::new(
        camera,
        location,
        flag_store.clone(),
        queue.clone(),
        config.capture_settings(),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        coordinator,
        flag_store.clone(),
        config.dispatch_deadline(),
    ));
    let monitor = FailedAuthMonitor::new(
        dispatcher.clone(),
        config.auth_failure_threshold,
        config.dispatch_deadline(),
    );

    let watcher = FlagWatcher::new(
        flag_store.clone(),
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
    );
    match &session_user {
        Some(user_id) => dispatcher.attach(&watcher, user_id),
        None => tracing::warn!("No signed-in user, remote commands are not watched"),
    }

    // Create shared application state
    let state = AppState::new(
        queue.clone(),
        dispatcher.clone(),
        monitor,
        flag_store,
        connectivity,
        session_user.clone(),
    );

    // Build local control routes
    let app = routes::api_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(MetricsState {
                handle: prometheus_handle,
                queue,
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(64 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Agent listening on {}", config.bind_addr);

    let shutdown = shutdown_signal(
        dispatcher,
        session_user.filter(|_| config.capture_on_shutdown),
        config.capture_step_timeout() * 2 + config.location_timeout(),
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    watcher.unwatch_all();
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.upload_timeout(), worker_handle).await.is_err() {
        tracing::warn!("Upload worker did not stop in time; unfinished tasks resume next start");
    }
    tracing::info!("Agent stopped");
}

/// Wait for Ctrl-C or SIGTERM. With a `capture_user`, run one capture for
/// that user and wait for it before letting the server stop.
async fn shutdown_signal(
    dispatcher: Arc<CommandDispatcher>,
    capture_user: Option<String>,
    capture_budget: Duration,
) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");

    let Some(user_id) = capture_user else {
        return;
    };
    let outcome = dispatcher
        .dispatch(Command::CaptureRequested {
            user_id: user_id.clone(),
            source: CommandSource::Shutdown,
        })
        .await;
    tracing::info!(user_id = %user_id, ?outcome, "Shutdown capture requested");

    if let Some(job) = dispatcher.take_job(&user_id).await {
        match tokio::time::timeout(capture_budget, job).await {
            Ok(Ok(report)) => tracing::info!(job_id = %report.job.id, outcome = ?report.outcome, "Shutdown capture finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "Shutdown capture task failed"),
            Err(_) => tracing::warn!("Shutdown capture did not finish in time"),
        }
    }
}

/// Session user: fixed USER_ID, else the saved session, else a fresh login
/// when credentials are configured.
async fn resolve_session_user(config: &AgentConfig, sessions: &SessionStore) -> Option<String> {
    if let Some(user_id) = &config.user_id {
        return Some(user_id.clone());
    }

    match sessions.load().await {
        Ok(Some(session)) => return Some(session.user_id),
        Ok(None) => {}
        Err(e) => tracing::warn!(error = %e, path = %sessions.path().display(), "Ignoring unreadable session file"),
    }

    let (Some(email), Some(password), Some(device_id)) = (
        config.login_email.clone(),
        config.login_password.clone(),
        config.device_id.clone(),
    ) else {
        return None;
    };

    let client = match LoginClient::new(&config.api_base_url, config.upload_timeout()) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build login client");
            return None;
        }
    };
    let request = LoginRequest {
        email,
        password,
        device_id,
    };
    match client.login(&request).await {
        Ok(session) => {
            if let Err(e) = sessions.save(&session).await {
                tracing::warn!(error = %e, "Failed to persist session");
            }
            Some(session.user_id)
        }
        Err(e) => {
            tracing::error!(error = %e, "Login failed");
            None
        }
    }
}
