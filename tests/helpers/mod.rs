//! In-process pipeline harness: every component wired to one in-memory bus
//! and store, driven batch by batch instead of by background loops.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use post_enrichment::app_state::AppState;
use post_enrichment::db::MemoryStore;
use post_enrichment::models::job::ImageJob;
use post_enrichment::models::stage::Stage;
use post_enrichment::services::aggregator::{Aggregator, AggregatorConsumer};
use post_enrichment::services::analysis::{AnalysisClient, AnalysisError};
use post_enrichment::services::consumer::ConsumerSettings;
use post_enrichment::services::memory_bus::InMemoryBus;
use post_enrichment::services::retry::RetryPolicy;
use post_enrichment::services::rules::RuleSet;
use post_enrichment::services::sync::SyncConsumer;
use post_enrichment::services::tracker::{CompletionTracker, TrackerSettings};
use post_enrichment::services::worker::{WorkerAdapter, WorkerSettings};
use strum::IntoEnumIterator;

use crate::fixtures::ImageFixture;

/// Answers from fixtures. Individual `(image, stage)` pairs can be made to
/// fail with a 503 until `recover` is called.
#[derive(Default)]
pub struct FixtureClient {
    images: HashMap<String, ImageFixture>,
    failing: Mutex<Vec<(String, Stage)>>,
    calls: AtomicU32,
}

impl FixtureClient {
    pub fn new(images: &[ImageFixture]) -> Self {
        Self {
            images: images
                .iter()
                .map(|image| (image.image_id.to_string(), image.clone()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn fail(&self, image_id: &str, stage: Stage) {
        self.failing.lock().unwrap().push((image_id.to_string(), stage));
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisClient for FixtureClient {
    async fn analyze(
        &self,
        stage: Stage,
        job: &ImageJob,
    ) -> Result<serde_json::Value, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing
            .lock()
            .unwrap()
            .iter()
            .any(|(image_id, s)| image_id == &job.image_id && *s == stage);
        if failing {
            return Err(AnalysisError::Server {
                status: 503,
                body: "model overloaded".to_string(),
            });
        }
        match self.images.get(&job.image_id) {
            Some(image) => Ok(image.response(stage)),
            None => Err(AnalysisError::Rejected {
                status: 404,
                body: format!("unknown image {}", job.image_id),
            }),
        }
    }
}

pub const MAX_ATTEMPTS: u32 = 3;

pub fn retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: MAX_ATTEMPTS,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    }
}

fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        batch_size: 16,
        block_timeout: Duration::ZERO,
        reclaim_idle: Duration::from_secs(60),
        max_deliveries: 5,
    }
}

pub struct Pipeline {
    pub bus: Arc<InMemoryBus>,
    pub store: Arc<MemoryStore>,
    pub client: Arc<FixtureClient>,
    pub state: AppState,
    workers: Vec<WorkerAdapter>,
    pub tracker: CompletionTracker,
    aggregator: AggregatorConsumer,
    sync: SyncConsumer,
}

impl Pipeline {
    pub async fn new(images: &[ImageFixture]) -> Self {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(FixtureClient::new(images));
        let state = AppState::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            Stage::iter().collect(),
        );

        let worker_settings = WorkerSettings {
            consumer: consumer_settings(),
            call_timeout: Duration::from_secs(5),
            retry: retry_policy(),
            reclaim_interval: Duration::from_secs(60),
        };
        let workers: Vec<WorkerAdapter> = Stage::iter()
            .map(|stage| {
                WorkerAdapter::new(
                    stage,
                    format!("{stage}-test-0"),
                    bus.clone(),
                    client.clone(),
                    worker_settings.clone(),
                )
            })
            .collect();

        let tracker = CompletionTracker::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            "tracker-test",
            TrackerSettings {
                consumer: consumer_settings(),
                stale_horizon: Duration::ZERO,
                sweep_interval: Duration::from_secs(60),
            },
        );
        let aggregator = AggregatorConsumer::new(
            Aggregator::new(
                bus.clone(),
                store.clone(),
                store.clone(),
                Arc::new(RuleSet::builtin(0.93)),
            ),
            bus.clone(),
            "aggregator-test",
            consumer_settings(),
            retry_policy(),
            Duration::from_secs(60),
        );
        let sync = SyncConsumer::new(
            bus.clone(),
            "sync-test",
            consumer_settings(),
            Duration::from_secs(60),
        );

        for worker in &workers {
            worker.start().await.unwrap();
        }
        tracker.start().await.unwrap();
        aggregator.start().await.unwrap();
        sync.start().await.unwrap();

        Self {
            bus,
            store,
            client,
            state,
            workers,
            tracker,
            aggregator,
            sync,
        }
    }

    /// Run every consumer until no channel has anything left to deliver.
    pub async fn settle(&self) {
        for _ in 0..50 {
            let mut handled = 0;
            for worker in &self.workers {
                handled += worker.process_batch().await.unwrap();
            }
            handled += self.tracker.process_batch().await.unwrap();
            handled += self.aggregator.process_batch().await.unwrap();
            handled += self.sync.process_batch().await.unwrap();
            if handled == 0 {
                return;
            }
        }
        panic!("pipeline did not settle");
    }
}
