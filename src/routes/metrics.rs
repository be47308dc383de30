use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::UploadQueue;

/// State of the scrape endpoint, kept apart from [`AppState`](crate::app_state::AppState).
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: UploadQueue,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the queue depth gauge, then renders the text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    if let Err(e) = state.queue.depth().await {
        tracing::warn!(error = %e, "Failed to refresh queue depth");
    }
    state.handle.render()
}
