use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::JobQueue;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<dyn JobQueue>,
}

/// Prometheus scrape endpoint. Refreshes the queue depth gauge first so
/// the admin process reports it even while no worker is polling.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(depth) => metrics::gauge!("video_queue_depth").set(depth as f64),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
    }
    state.handle.render()
}
