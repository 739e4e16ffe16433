use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use post_enrichment::{
    config::AppConfig,
    routes,
    services::{
        analysis::HttpAnalysisClient,
        bus::RedisStreamBus,
        worker::{spawn_pool, WorkerSettings},
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting stage workers");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let stages = config.worker_stage_set().expect("Invalid WORKER_STAGES");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        routes::metrics::describe();
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let bus = Arc::new(RedisStreamBus::new(&config.redis_url).expect("Failed to initialize message bus"));
    let client = Arc::new(
        HttpAnalysisClient::new(
            &config.analysis_base_url,
            config.analysis_api_token.clone(),
            config.analysis_timeout(),
        )
        .expect("Failed to initialize analysis client"),
    );
    let settings = WorkerSettings::from_config(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for stage in stages {
        tracing::info!(stage = %stage, workers = config.workers_per_stage, "Spawning worker pool");
        handles.extend(spawn_pool(
            stage,
            config.workers_per_stage,
            bus.clone(),
            client.clone(),
            settings.clone(),
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    for result in join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Workers stopped");
}
