//! Generic consume → invoke → produce loop, one consumer group per stage.
//!
//! A job is acknowledged only after its [`StageResult`] or its dead letter
//! has been published. A crash between the two leaves the job pending; it is
//! reclaimed later and may yield a duplicate result, which the merge dedups.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::analysis::{AnalysisClient, AnalysisError};
use super::bus::{BusError, Delivery, MessageBus, IMAGE_JOBS, STAGE_RESULTS};
use super::consumer::{ConsumerSettings, GroupConsumer};
use super::retry::RetryPolicy;
use super::stages::{transform_for, StageTransform};
use crate::config::AppConfig;
use crate::models::dead_letter::FailureKind;
use crate::models::job::ImageJob;
use crate::models::stage::{Stage, StageResult};

/// Pause after a failed bus call before polling again.
const BUS_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub consumer: ConsumerSettings,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub reclaim_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            consumer: ConsumerSettings::from_config(config),
            call_timeout: config.analysis_timeout(),
            retry: config.retry_policy(),
            reclaim_interval: config.sweep_interval(),
        }
    }
}

/// What became of one admitted job.
#[derive(Debug)]
enum Outcome {
    Produced(StageResult),
    Failed {
        kind: FailureKind,
        reason: String,
        attempts: u32,
    },
    /// Replayed job addressed to another stage.
    Skipped,
}

pub struct WorkerAdapter {
    stage: Stage,
    consumer: GroupConsumer,
    bus: Arc<dyn MessageBus>,
    client: Arc<dyn AnalysisClient>,
    transform: StageTransform,
    settings: WorkerSettings,
}

impl WorkerAdapter {
    pub fn new(
        stage: Stage,
        consumer: impl Into<String>,
        bus: Arc<dyn MessageBus>,
        client: Arc<dyn AnalysisClient>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            stage,
            consumer: GroupConsumer::new(
                bus.clone(),
                IMAGE_JOBS,
                stage.consumer_group(),
                consumer,
                stage.as_ref(),
                settings.consumer.clone(),
            ),
            bus,
            client,
            transform: transform_for(stage),
            settings,
        }
    }

    /// Create the stage's consumer group if it does not exist yet.
    pub async fn start(&self) -> Result<(), BusError> {
        self.consumer.start().await
    }

    /// Consume one batch and handle every job in it. Returns the number of
    /// deliveries handled.
    pub async fn process_batch(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.next_batch().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            self.handle(delivery).await?;
        }
        Ok(handled)
    }

    /// Claim jobs abandoned by crashed consumers of this group and handle
    /// them like fresh deliveries.
    pub async fn reclaim(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.reclaim().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            self.handle(delivery).await?;
        }
        Ok(handled)
    }

    /// Poll until `shutdown` flips, reclaiming idle jobs between batches.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.start().await {
            tracing::error!(stage = %self.stage, error = %e, "Failed to create consumer group");
        }
        tracing::info!(stage = %self.stage, consumer = %self.consumer.consumer(), "Worker started");

        let mut last_reclaim = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.process_batch() => {
                    if let Err(e) = result {
                        tracing::error!(stage = %self.stage, error = %e, "Batch failed, will retry");
                        tokio::time::sleep(BUS_ERROR_BACKOFF).await;
                    }
                }
            }

            if last_reclaim.elapsed() >= self.settings.reclaim_interval {
                last_reclaim = Instant::now();
                if let Err(e) = self.reclaim().await {
                    tracing::error!(stage = %self.stage, error = %e, "Reclaim pass failed");
                }
            }
        }

        tracing::info!(stage = %self.stage, consumer = %self.consumer.consumer(), "Worker stopped");
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        let admitted = self
            .consumer
            .admit_with(&delivery, |job: &ImageJob| self.replayable(job))
            .await?;
        let Some(job) = admitted else {
            return Ok(());
        };

        match self.evaluate(&job).await {
            Outcome::Produced(result) => {
                self.bus.publish_json(STAGE_RESULTS, &result).await?;
                metrics::counter!("stage_jobs_processed_total", "stage" => self.stage.to_string())
                    .increment(1);
                tracing::info!(
                    stage = %self.stage,
                    post_id = %result.post_id,
                    image_id = %result.image_id,
                    message_id = %delivery.id,
                    "Stage result published"
                );
                self.consumer.ack(&delivery).await
            }
            Outcome::Failed {
                kind,
                reason,
                attempts,
            } => {
                metrics::counter!(
                    "stage_jobs_dead_lettered_total",
                    "stage" => self.stage.to_string(),
                    "kind" => kind.to_string()
                )
                .increment(1);
                self.consumer
                    .dead_letter(&delivery, self.replayable(&job), kind, reason, attempts)
                    .await
            }
            Outcome::Skipped => {
                tracing::debug!(stage = %self.stage, message_id = %delivery.id, "Job addressed to another stage");
                self.consumer.ack(&delivery).await
            }
        }
    }

    async fn evaluate(&self, job: &ImageJob) -> Outcome {
        if !job.is_for(self.stage) {
            return Outcome::Skipped;
        }

        let (raw, attempts) = match self.invoke(job).await {
            Ok(ok) => ok,
            Err((e, attempts)) => {
                let kind = if e.is_transient() {
                    FailureKind::RetriesExhausted
                } else {
                    FailureKind::Permanent
                };
                return Outcome::Failed {
                    kind,
                    reason: e.to_string(),
                    attempts,
                };
            }
        };

        match (self.transform)(&raw) {
            Ok(payload) => Outcome::Produced(StageResult {
                post_id: job.post_id.clone(),
                image_id: job.image_id.clone(),
                stage: self.stage,
                payload,
                produced_at: Utc::now(),
                correlation_id: job.correlation_id,
            }),
            Err(e) => Outcome::Failed {
                kind: FailureKind::Permanent,
                reason: e.to_string(),
                attempts,
            },
        }
    }

    /// Call the collaborator, retrying transient failures with backoff.
    /// Returns the response or the last error, with the attempts made.
    async fn invoke(&self, job: &ImageJob) -> Result<(serde_json::Value, u32), (AnalysisError, u32)> {
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = tokio::time::timeout(
                self.settings.call_timeout,
                self.client.analyze(self.stage, job),
            )
            .await
            .unwrap_or(Err(AnalysisError::Timeout(self.settings.call_timeout)));
            metrics::histogram!("stage_analysis_seconds", "stage" => self.stage.to_string())
                .record(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(raw) => return Ok((raw, attempt)),
                Err(e) => e,
            };

            metrics::counter!(
                "stage_attempt_failures_total",
                "stage" => self.stage.to_string(),
                "kind" => error.kind()
            )
            .increment(1);

            if !error.is_transient() || !policy.allows_retry(attempt) {
                return Err((error, attempt));
            }

            let delay = policy.delay_after(attempt);
            tracing::warn!(
                stage = %self.stage,
                post_id = %job.post_id,
                image_id = %job.image_id,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient analysis failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// The job as it should be replayed: addressed to this stage only.
    fn replayable(&self, job: &ImageJob) -> serde_json::Value {
        let targeted = ImageJob {
            target_stage: Some(self.stage),
            ..job.clone()
        };
        serde_json::to_value(&targeted).unwrap_or(serde_json::Value::Null)
    }
}

/// Spawn `count` competing consumers for one stage.
pub fn spawn_pool(
    stage: Stage,
    count: usize,
    bus: Arc<dyn MessageBus>,
    client: Arc<dyn AnalysisClient>,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let instance = Uuid::new_v4().simple().to_string();
    let instance = &instance[..8];

    (0..count.max(1))
        .map(|i| {
            let worker = WorkerAdapter::new(
                stage,
                format!("{stage}-{instance}-{i}"),
                bus.clone(),
                client.clone(),
                settings.clone(),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dead_letter::DeadLetter;
    use crate::services::bus::dead_letter_channel;
    use crate::services::memory_bus::InMemoryBus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays canned responses; the last one repeats forever.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<serde_json::Value, AnalysisError>>>,
        fallback: fn() -> Result<serde_json::Value, AnalysisError>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(
            script: Vec<Result<serde_json::Value, AnalysisError>>,
            fallback: fn() -> Result<serde_json::Value, AnalysisError>,
        ) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisClient for ScriptedClient {
        async fn analyze(
            &self,
            _stage: Stage,
            _job: &ImageJob,
        ) -> Result<serde_json::Value, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(self.fallback)
        }
    }

    fn unavailable() -> Result<serde_json::Value, AnalysisError> {
        Err(AnalysisError::Server {
            status: 503,
            body: "overloaded".to_string(),
        })
    }

    fn tags() -> Result<serde_json::Value, AnalysisError> {
        Ok(json!({"tags": ["beach", "person"]}))
    }

    fn settings(max_attempts: u32) -> WorkerSettings {
        WorkerSettings {
            consumer: ConsumerSettings {
                batch_size: 10,
                block_timeout: Duration::ZERO,
                reclaim_idle: Duration::ZERO,
                max_deliveries: 5,
            },
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
            reclaim_interval: Duration::from_secs(60),
        }
    }

    fn job(target_stage: Option<Stage>) -> ImageJob {
        ImageJob {
            post_id: "post-1".to_string(),
            image_id: "img-1".to_string(),
            image_url: "https://cdn.example.com/img-1.jpg".to_string(),
            uploader_id: "user-1".to_string(),
            correlation_id: Uuid::new_v4(),
            target_stage,
        }
    }

    async fn setup(
        client: ScriptedClient,
        settings: WorkerSettings,
    ) -> (Arc<InMemoryBus>, Arc<ScriptedClient>, WorkerAdapter) {
        let bus = Arc::new(InMemoryBus::new());
        let client = Arc::new(client);
        let worker = WorkerAdapter::new(Stage::Tagging, "w1", bus.clone(), client.clone(), settings);
        worker.start().await.unwrap();
        (bus, client, worker)
    }

    async fn publish_job(bus: &InMemoryBus, job: &ImageJob) {
        bus.publish(IMAGE_JOBS, &serde_json::to_value(job).unwrap())
            .await
            .unwrap();
    }

    fn dead_letters(bus: &InMemoryBus) -> Vec<DeadLetter> {
        bus.messages(&dead_letter_channel("tagging"))
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_success_publishes_result_then_acks() {
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], tags), settings(3)).await;
        let sent = job(None);
        publish_job(&bus, &sent).await;

        assert_eq!(worker.process_batch().await.unwrap(), 1);
        assert_eq!(client.calls(), 1);

        let results = bus.messages(STAGE_RESULTS);
        assert_eq!(results.len(), 1);
        let result: StageResult = serde_json::from_value(results[0].clone()).unwrap();
        assert_eq!(result.stage, Stage::Tagging);
        assert_eq!(result.correlation_id, sent.correlation_id);
        assert!(result.is_consistent());
        assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let script = vec![unavailable(), unavailable()];
        let (bus, client, worker) = setup(ScriptedClient::new(script, tags), settings(3)).await;
        publish_job(&bus, &job(None)).await;

        worker.process_batch().await.unwrap();
        assert_eq!(client.calls(), 3);
        assert_eq!(bus.messages(STAGE_RESULTS).len(), 1);
        assert!(dead_letters(&bus).is_empty());
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_exact() {
        for max_attempts in [1, 2, 4] {
            let (bus, client, worker) =
                setup(ScriptedClient::new(vec![], unavailable), settings(max_attempts)).await;
            publish_job(&bus, &job(None)).await;

            worker.process_batch().await.unwrap();
            assert_eq!(client.calls(), max_attempts);

            let letters = dead_letters(&bus);
            assert_eq!(letters.len(), 1);
            assert_eq!(letters[0].failure_kind, FailureKind::RetriesExhausted);
            assert_eq!(letters[0].attempt_count, max_attempts);
            assert_eq!(letters[0].origin_channel, IMAGE_JOBS);
            assert_eq!(letters[0].original_message["target_stage"], "tagging");
            assert!(bus.messages(STAGE_RESULTS).is_empty());
            assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_rejected_input_is_not_retried() {
        fn rejected() -> Result<serde_json::Value, AnalysisError> {
            Err(AnalysisError::Rejected {
                status: 422,
                body: "unsupported image".to_string(),
            })
        }
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], rejected), settings(4)).await;
        publish_job(&bus, &job(None)).await;

        worker.process_batch().await.unwrap();
        assert_eq!(client.calls(), 1);
        let letters = dead_letters(&bus);
        assert_eq!(letters[0].failure_kind, FailureKind::Permanent);
        assert_eq!(letters[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_unusable_response_is_permanent() {
        fn wrong() -> Result<serde_json::Value, AnalysisError> {
            Ok(json!({"labels": "nope"}))
        }
        let (bus, _client, worker) = setup(ScriptedClient::new(vec![], wrong), settings(4)).await;
        publish_job(&bus, &job(None)).await;

        worker.process_batch().await.unwrap();
        assert_eq!(dead_letters(&bus)[0].failure_kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_malformed_job_is_dead_lettered_without_calls() {
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], tags), settings(4)).await;
        bus.publish(IMAGE_JOBS, &json!({"post_id": 7})).await.unwrap();

        worker.process_batch().await.unwrap();
        assert_eq!(client.calls(), 0);
        let letters = dead_letters(&bus);
        assert_eq!(letters[0].failure_kind, FailureKind::Malformed);
        assert_eq!(letters[0].original_message, json!({"post_id": 7}));
        assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_for_another_stage_is_skipped() {
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], tags), settings(4)).await;
        publish_job(&bus, &job(Some(Stage::Caption))).await;

        worker.process_batch().await.unwrap();
        assert_eq!(client.calls(), 0);
        assert!(bus.messages(STAGE_RESULTS).is_empty());
        assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_transient() {
        let mut client = ScriptedClient::new(vec![], tags);
        client.delay = Duration::from_millis(200);
        let mut s = settings(2);
        s.call_timeout = Duration::from_millis(10);
        let (bus, client, worker) = setup(client, s).await;
        publish_job(&bus, &job(None)).await;

        worker.process_batch().await.unwrap();
        assert_eq!(client.calls(), 2);
        let letters = dead_letters(&bus);
        assert_eq!(letters[0].failure_kind, FailureKind::RetriesExhausted);
        assert!(letters[0].failure_reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_reclaims_job_abandoned_by_crashed_consumer() {
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], tags), settings(4)).await;
        publish_job(&bus, &job(None)).await;

        // Another consumer takes the job and dies before acking.
        let taken = bus
            .consume(IMAGE_JOBS, "stage-tagging", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(taken.len(), 1);

        assert_eq!(worker.reclaim().await.unwrap(), 1);
        assert_eq!(client.calls(), 1);
        assert_eq!(bus.messages(STAGE_RESULTS).len(), 1);
        assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poison_message_guard() {
        let mut s = settings(4);
        s.consumer.max_deliveries = 1;
        let (bus, client, worker) = setup(ScriptedClient::new(vec![], tags), s).await;
        publish_job(&bus, &job(None)).await;
        bus.consume(IMAGE_JOBS, "stage-tagging", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();

        worker.reclaim().await.unwrap();
        assert_eq!(client.calls(), 0);
        let letters = dead_letters(&bus);
        assert_eq!(letters[0].failure_kind, FailureKind::Poison);
        assert_eq!(letters[0].attempt_count, 2);
        assert_eq!(letters[0].consumer_group, "stage-tagging");
        // Replays to this stage only, not to every stage.
        assert_eq!(letters[0].original_message["target_stage"], "tagging");
        assert!(bus.pending(IMAGE_JOBS, "stage-tagging").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let client: Arc<dyn AnalysisClient> = Arc::new(ScriptedClient::new(vec![], tags));
        let mut s = settings(1);
        s.consumer.block_timeout = Duration::from_millis(20);
        let (tx, rx) = watch::channel(false);

        let handles = spawn_pool(Stage::Tagging, 2, bus, client, s, rx);
        assert_eq!(handles.len(), 2);
        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
