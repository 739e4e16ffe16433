//! Completion tracking: decides when a post is ready to aggregate.
//!
//! Three ready-signals feed the aggregation-trigger channel:
//! - `complete`: every expected `(image, stage)` pair has reported;
//! - `partial`: the post stayed incomplete past the stale horizon;
//! - `forced`: an operator asked for aggregation with what exists now.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::bus::{BusError, Delivery, MessageBus, MessageId, AGGREGATION_TRIGGER, STAGE_RESULTS};
use super::consumer::{ConsumerSettings, GroupConsumer};
use super::sync::SyncPropagator;
use crate::db::{ProgressStore, RecordStore, StoreError};
use crate::models::dead_letter::FailureKind;
use crate::models::progress::{AggregationTrigger, ProgressStatus, TriggerReason};
use crate::models::stage::StageResult;

pub const TRACKER_GROUP: &str = "tracker";
const DEAD_LETTER_SOURCE: &str = "tracker";
const STALE_SWEEP_LIMIT: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown post `{0}`")]
    UnknownPost(String),
}

/// What observing one result changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Recorded; the post still waits for other pairs.
    Recorded,
    /// Recorded and the post is now complete; a trigger was published.
    Completed,
    /// Stored, but no progress expects this pair.
    Untracked,
}

/// Issues aggregation triggers. Shared by the tracker consumer, the stale
/// sweeper and the API's forced trigger.
#[derive(Clone)]
pub struct TriggerIssuer {
    bus: Arc<dyn MessageBus>,
    progress: Arc<dyn ProgressStore>,
}

impl TriggerIssuer {
    pub fn new(bus: Arc<dyn MessageBus>, progress: Arc<dyn ProgressStore>) -> Self {
        Self { bus, progress }
    }

    async fn publish(&self, post_id: &str, reason: TriggerReason) -> Result<MessageId, BusError> {
        let trigger = AggregationTrigger::new(post_id, reason);
        let id = self.bus.publish_json(AGGREGATION_TRIGGER, &trigger).await?;
        metrics::counter!("aggregation_triggers_total", "reason" => reason.to_string()).increment(1);
        Ok(id)
    }

    /// Ask for aggregation with whatever results exist now. Always
    /// re-aggregates, so it also picks up results that arrived after an
    /// earlier pass.
    pub async fn force(&self, post_id: &str) -> Result<MessageId, TrackerError> {
        if self.progress.get(post_id).await?.is_none() {
            return Err(TrackerError::UnknownPost(post_id.to_string()));
        }
        let id = self.publish(post_id, TriggerReason::Forced).await?;
        tracing::info!(post_id = %post_id, message_id = %id, "Forced aggregation requested");
        Ok(id)
    }

    /// Emit one partial trigger per post left incomplete past `horizon`.
    pub async fn sweep_stale(&self, horizon: Duration) -> Result<usize, TrackerError> {
        let horizon = chrono::Duration::seconds(horizon.as_secs() as i64);
        let cutoff = Utc::now() - horizon;
        let mut fired = 0;

        for progress in self.progress.stale(cutoff, STALE_SWEEP_LIMIT).await? {
            // Another sweeper may have taken it.
            if !self.progress.mark_partial(&progress.post_id).await? {
                continue;
            }
            self.publish(&progress.post_id, TriggerReason::Partial).await?;
            fired += 1;
            tracing::warn!(
                post_id = %progress.post_id,
                completed = progress.completed_count(),
                expected = progress.expected_count(),
                missing = ?progress.missing().iter().map(|p| p.key()).collect::<Vec<_>>(),
                "Post stale, partial aggregation requested"
            );
        }
        Ok(fired)
    }
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub consumer: ConsumerSettings,
    pub stale_horizon: Duration,
    pub sweep_interval: Duration,
}

/// Consumes stage results, records them and marks progress.
pub struct CompletionTracker {
    consumer: GroupConsumer,
    progress: Arc<dyn ProgressStore>,
    records: Arc<dyn RecordStore>,
    triggers: TriggerIssuer,
    sync: SyncPropagator,
    settings: TrackerSettings,
}

impl CompletionTracker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        progress: Arc<dyn ProgressStore>,
        records: Arc<dyn RecordStore>,
        consumer: impl Into<String>,
        settings: TrackerSettings,
    ) -> Self {
        Self {
            triggers: TriggerIssuer::new(bus.clone(), progress.clone()),
            sync: SyncPropagator::new(bus.clone()),
            consumer: GroupConsumer::new(
                bus,
                STAGE_RESULTS,
                TRACKER_GROUP,
                consumer,
                DEAD_LETTER_SOURCE,
                settings.consumer.clone(),
            ),
            progress,
            records,
            settings,
        }
    }

    pub fn triggers(&self) -> &TriggerIssuer {
        &self.triggers
    }

    pub async fn start(&self) -> Result<(), BusError> {
        self.consumer.start().await
    }

    /// Store the result, mark its pair, and fire the completion trigger when
    /// the post has every expected pair. Observing the same result again
    /// changes nothing except re-sending its sync pointer and possibly
    /// re-firing the trigger of a post that has not been aggregated yet.
    pub async fn observe(&self, result: &StageResult) -> Result<Observation, TrackerError> {
        if self.records.insert_stage_result(result).await? {
            metrics::counter!("stage_results_observed_total", "stage" => result.stage.to_string())
                .increment(1);
        }
        // Pointers are idempotent; a redelivery must not lose one.
        self.sync.stage_result_updated(result).await?;

        let Some(progress) = self
            .progress
            .mark_complete(&result.post_id, &result.image_id, result.stage)
            .await?
        else {
            tracing::warn!(
                post_id = %result.post_id,
                image_id = %result.image_id,
                stage = %result.stage,
                "Result for an untracked post or unexpected pair"
            );
            return Ok(Observation::Untracked);
        };

        tracing::debug!(
            post_id = %result.post_id,
            image_id = %result.image_id,
            stage = %result.stage,
            completed = progress.completed_count(),
            expected = progress.expected_count(),
            "Stage result observed"
        );

        if progress.is_complete() && progress.status != ProgressStatus::Aggregated {
            self.triggers
                .publish(&result.post_id, TriggerReason::Complete)
                .await?;
            tracing::info!(post_id = %result.post_id, "Post complete, aggregation requested");
            return Ok(Observation::Completed);
        }
        Ok(Observation::Recorded)
    }

    pub async fn process_batch(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.next_batch().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            self.handle(delivery).await?;
        }
        Ok(handled)
    }

    pub async fn reclaim(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.reclaim().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            self.handle(delivery).await?;
        }
        Ok(handled)
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), BusError> {
        let Some(result) = self.consumer.admit::<StageResult>(&delivery).await? else {
            return Ok(());
        };
        if !result.is_consistent() {
            let reason = format!(
                "stage `{}` does not match payload kind `{}`",
                result.stage,
                result.payload.stage()
            );
            return self
                .consumer
                .reject(&delivery, FailureKind::Malformed, reason, 0)
                .await;
        }

        match self.observe(&result).await {
            Ok(_) => self.consumer.ack(&delivery).await,
            // Left pending: reclaimed later, dead-lettered as poison if it
            // keeps failing.
            Err(e) => {
                tracing::error!(
                    post_id = %result.post_id,
                    image_id = %result.image_id,
                    stage = %result.stage,
                    message_id = %delivery.id,
                    error = %e,
                    "Failed to record stage result"
                );
                Ok(())
            }
        }
    }

    /// Consume results until shutdown; sweep stale posts and reclaim idle
    /// results every sweep interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "Failed to create tracker consumer group");
        }
        tracing::info!("Completion tracker started");

        let mut last_sweep = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.process_batch() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Tracker batch failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            if last_sweep.elapsed() >= self.settings.sweep_interval {
                last_sweep = Instant::now();
                if let Err(e) = self.triggers.sweep_stale(self.settings.stale_horizon).await {
                    tracing::error!(error = %e, "Stale sweep failed");
                }
                if let Err(e) = self.reclaim().await {
                    tracing::error!(error = %e, "Tracker reclaim failed");
                }
            }
        }
        tracing::info!("Completion tracker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::progress::PostProgress;
    use crate::models::stage::{Stage, StagePayload};
    use crate::services::bus::{dead_letter_channel, SYNC_QUEUE};
    use crate::services::memory_bus::InMemoryBus;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    struct Fixture {
        bus: Arc<InMemoryBus>,
        store: Arc<MemoryStore>,
        tracker: CompletionTracker,
    }

    async fn fixture() -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let store = Arc::new(MemoryStore::new());
        let tracker = CompletionTracker::new(
            bus.clone(),
            store.clone(),
            store.clone(),
            "t1",
            TrackerSettings {
                consumer: ConsumerSettings {
                    batch_size: 10,
                    block_timeout: Duration::ZERO,
                    reclaim_idle: Duration::ZERO,
                    max_deliveries: 5,
                },
                stale_horizon: Duration::from_secs(900),
                sweep_interval: Duration::from_secs(30),
            },
        );
        tracker.start().await.unwrap();
        store
            .register(&PostProgress::new(
                "post-1",
                BTreeSet::from(["a".to_string(), "b".to_string()]),
                BTreeSet::from([Stage::Tagging, Stage::Caption]),
            ))
            .await
            .unwrap();
        Fixture { bus, store, tracker }
    }

    fn tagging(image_id: &str) -> StageResult {
        StageResult {
            post_id: "post-1".to_string(),
            image_id: image_id.to_string(),
            stage: Stage::Tagging,
            payload: StagePayload::Tagging {
                tags: vec!["beach".to_string()],
            },
            produced_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    fn caption(image_id: &str) -> StageResult {
        StageResult {
            stage: Stage::Caption,
            payload: StagePayload::Caption {
                caption: "waves".to_string(),
            },
            ..tagging(image_id)
        }
    }

    fn triggers(bus: &InMemoryBus) -> Vec<AggregationTrigger> {
        bus.messages(AGGREGATION_TRIGGER)
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_trigger_fires_only_when_every_pair_reported() {
        let f = fixture().await;
        assert_eq!(f.tracker.observe(&tagging("a")).await.unwrap(), Observation::Recorded);
        assert_eq!(f.tracker.observe(&caption("a")).await.unwrap(), Observation::Recorded);
        assert_eq!(f.tracker.observe(&tagging("b")).await.unwrap(), Observation::Recorded);
        assert!(triggers(&f.bus).is_empty());

        assert_eq!(f.tracker.observe(&caption("b")).await.unwrap(), Observation::Completed);
        let fired = triggers(&f.bus);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, TriggerReason::Complete);
    }

    #[tokio::test]
    async fn test_duplicate_result_does_not_advance_progress() {
        let f = fixture().await;
        let result = tagging("a");
        f.tracker.observe(&result).await.unwrap();
        f.tracker.observe(&result).await.unwrap();

        let progress = f.store.get("post-1").await.unwrap().unwrap();
        assert_eq!(progress.completed_count(), 1);
        assert_eq!(f.store.stage_results("post-1").await.unwrap().len(), 1);
        // Every observation re-sends the same pointer.
        let pointers = f.bus.messages(SYNC_QUEUE);
        assert_eq!(pointers.len(), 2);
        assert!(pointers.iter().all(|p| p["entity_id"] == "post-1/a/tagging"));
    }

    #[tokio::test]
    async fn test_redispatch_with_fewer_images_completes_on_remaining_pairs() {
        let f = fixture().await;
        assert_eq!(f.tracker.observe(&tagging("b")).await.unwrap(), Observation::Recorded);
        assert_eq!(f.tracker.observe(&caption("b")).await.unwrap(), Observation::Recorded);

        // Image b was dropped from the post.
        f.store
            .register(&PostProgress::new(
                "post-1",
                BTreeSet::from(["a".to_string()]),
                BTreeSet::from([Stage::Tagging, Stage::Caption]),
            ))
            .await
            .unwrap();
        let progress = f.store.get("post-1").await.unwrap().unwrap();
        assert_eq!(progress.completed_count(), 0);
        assert!(!progress.is_complete());

        assert_eq!(f.tracker.observe(&tagging("a")).await.unwrap(), Observation::Recorded);
        assert!(triggers(&f.bus).is_empty());
        assert_eq!(f.tracker.observe(&caption("a")).await.unwrap(), Observation::Completed);
        assert_eq!(triggers(&f.bus).len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_observers_fire_exactly_one_trigger() {
        const IMAGES: usize = 16;
        let f = fixture().await;
        let images: BTreeSet<String> = (0..IMAGES).map(|i| format!("img-{i}")).collect();
        f.store
            .register(&PostProgress::new(
                "post-many",
                images.clone(),
                BTreeSet::from([Stage::Tagging]),
            ))
            .await
            .unwrap();

        let tracker = Arc::new(f.tracker);
        let tasks: Vec<_> = images
            .into_iter()
            .map(|image_id| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    let result = StageResult {
                        post_id: "post-many".to_string(),
                        ..tagging(&image_id)
                    };
                    tracker.observe(&result).await.unwrap()
                })
            })
            .collect();

        let mut completed = 0;
        for task in tasks {
            if task.await.unwrap() == Observation::Completed {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);

        let progress = f.store.get("post-many").await.unwrap().unwrap();
        assert_eq!(progress.completed_count(), IMAGES);
        assert!(progress.is_complete());
        let fired = triggers(&f.bus);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].post_id, "post-many");
        assert_eq!(fired[0].reason, TriggerReason::Complete);
    }

    #[tokio::test]
    async fn test_no_trigger_after_aggregation() {
        let f = fixture().await;
        for r in [tagging("a"), caption("a"), tagging("b"), caption("b")] {
            f.tracker.observe(&r).await.unwrap();
        }
        f.store.mark_aggregated("post-1").await.unwrap();

        // Redelivered copy after the post was archived.
        assert_eq!(f.tracker.observe(&caption("b")).await.unwrap(), Observation::Recorded);
        assert_eq!(triggers(&f.bus).len(), 1);
    }

    #[tokio::test]
    async fn test_untracked_results_are_kept_but_do_not_trigger() {
        let f = fixture().await;
        let mut stray = tagging("zzz");
        assert_eq!(f.tracker.observe(&stray).await.unwrap(), Observation::Untracked);
        stray.post_id = "unknown".to_string();
        assert_eq!(f.tracker.observe(&stray).await.unwrap(), Observation::Untracked);
        assert!(triggers(&f.bus).is_empty());
    }

    #[tokio::test]
    async fn test_consumer_acks_and_dead_letters_inconsistent_results() {
        let f = fixture().await;
        f.bus
            .publish(STAGE_RESULTS, &serde_json::to_value(tagging("a")).unwrap())
            .await
            .unwrap();
        let mut bad = tagging("b");
        bad.stage = Stage::Caption;
        f.bus
            .publish(STAGE_RESULTS, &serde_json::to_value(bad).unwrap())
            .await
            .unwrap();

        assert_eq!(f.tracker.process_batch().await.unwrap(), 2);
        assert!(f.bus.pending(STAGE_RESULTS, TRACKER_GROUP).await.unwrap().is_empty());
        let letters = f.bus.messages(&dead_letter_channel("tracker"));
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0]["failure_kind"], "malformed");
        assert_eq!(f.store.get("post-1").await.unwrap().unwrap().completed_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_sweep_fires_one_partial_trigger() {
        let f = fixture().await;
        let mut old = PostProgress::new(
            "post-old",
            BTreeSet::from(["x".to_string()]),
            BTreeSet::from([Stage::Face]),
        );
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        f.store.register(&old).await.unwrap();

        let issuer = f.tracker.triggers();
        assert_eq!(issuer.sweep_stale(Duration::from_secs(900)).await.unwrap(), 1);
        assert_eq!(issuer.sweep_stale(Duration::from_secs(900)).await.unwrap(), 0);

        let fired = triggers(&f.bus);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].post_id, "post-old");
        assert_eq!(fired[0].reason, TriggerReason::Partial);
    }

    #[tokio::test]
    async fn test_completion_after_partial_still_fires() {
        let f = fixture().await;
        assert!(f.store.mark_partial("post-1").await.unwrap());
        for r in [tagging("a"), caption("a"), tagging("b"), caption("b")] {
            f.tracker.observe(&r).await.unwrap();
        }
        assert_eq!(triggers(&f.bus).last().unwrap().reason, TriggerReason::Complete);
    }

    #[tokio::test]
    async fn test_forced_trigger() {
        let f = fixture().await;
        let issuer = f.tracker.triggers();
        issuer.force("post-1").await.unwrap();
        issuer.force("post-1").await.unwrap();
        assert_eq!(triggers(&f.bus).len(), 2);
        assert!(matches!(
            issuer.force("missing").await,
            Err(TrackerError::UnknownPost(_))
        ));
    }
}
