use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::app_state::AppState;
use crate::db::jobs;
use crate::services::queue::MAX_CALLS;

/// State of the metrics route: the recorder handle plus the store to sample.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub app: AppState,
}

/// GET /metrics: Prometheus text format, with queue depth sampled per scrape.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match jobs::pending_counts(&state.app.db, MAX_CALLS).await {
        Ok(counts) => {
            for (job_type, pending) in counts {
                metrics::gauge!("jobs_pending", "job_type" => job_type).set(pending as f64);
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to sample queue depth"),
    }
    state.handle.render()
}
