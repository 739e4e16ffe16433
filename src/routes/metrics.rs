use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics: Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for every pipeline metric.
pub fn describe() {
    metrics::describe_counter!("image_jobs_published_total", "Image jobs published by the dispatcher");
    metrics::describe_counter!("stage_jobs_processed_total", "Image jobs that produced a stage result");
    metrics::describe_counter!("stage_jobs_dead_lettered_total", "Image jobs routed to a dead-letter channel");
    metrics::describe_counter!("stage_attempt_failures_total", "Failed analysis calls, including retried ones");
    metrics::describe_histogram!("stage_analysis_seconds", "Latency of one analysis call");
    metrics::describe_counter!("stage_results_observed_total", "New stage results recorded by the tracker");
    metrics::describe_counter!("aggregation_triggers_total", "Aggregation triggers issued");
    metrics::describe_counter!("aggregations_total", "Aggregation passes that wrote a record");
    metrics::describe_histogram!("aggregation_seconds", "Time to load, merge and publish one post");
    metrics::describe_counter!("sync_messages_published_total", "Pointers published to the sync queue");
    metrics::describe_counter!("dead_letters_replayed_total", "Dead letters republished to their origin");
    metrics::describe_gauge!("channel_pending_entries", "Unacknowledged entries per channel and group");
}
