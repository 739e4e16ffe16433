use futures::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use post_enrichment::{
    config::AppConfig,
    db::{self, queries::PgStore},
    routes,
    services::{
        aggregator::{Aggregator, AggregatorConsumer},
        bus::RedisStreamBus,
        consumer::ConsumerSettings,
        rules::RuleSet,
        sync::SyncConsumer,
        tracker::{CompletionTracker, TrackerSettings},
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting completion tracker and aggregator");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        routes::metrics::describe();
        tracing::info!(%addr, "Metrics exporter listening");
    }

    let rules = RuleSet::load(config.event_rules_path.as_deref(), config.tag_match_threshold)
        .expect("Failed to load event rules");
    tracing::info!(
        rules = rules.rules().len(),
        threshold = config.tag_match_threshold,
        "Event rules loaded"
    );

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let store = Arc::new(PgStore::new(db_pool));

    let bus = Arc::new(RedisStreamBus::new(&config.redis_url).expect("Failed to initialize message bus"));

    let instance = Uuid::new_v4().simple().to_string();
    let instance = &instance[..8];
    let consumer_settings = ConsumerSettings::from_config(&config);
    let reclaim_interval = config.sweep_interval();

    let tracker = CompletionTracker::new(
        bus.clone(),
        store.clone(),
        store.clone(),
        format!("tracker-{instance}"),
        TrackerSettings {
            consumer: consumer_settings.clone(),
            stale_horizon: config.stale_horizon(),
            sweep_interval: config.sweep_interval(),
        },
    );
    let aggregator = AggregatorConsumer::new(
        Aggregator::new(bus.clone(), store.clone(), store, Arc::new(rules)),
        bus.clone(),
        format!("aggregator-{instance}"),
        consumer_settings.clone(),
        config.retry_policy(),
        reclaim_interval,
    );
    let sync = SyncConsumer::new(
        bus,
        format!("sync-{instance}"),
        consumer_settings,
        reclaim_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { tracker.run(shutdown).await })
        },
        {
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { aggregator.run(shutdown).await })
        },
        tokio::spawn(async move { sync.run(shutdown_rx).await }),
    ];

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    for result in join_all(handles).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Consumer task panicked");
        }
    }
    tracing::info!("Aggregator stopped");
}
