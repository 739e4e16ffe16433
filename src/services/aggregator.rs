use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::bus::{BusError, Delivery, MessageBus, AGGREGATION_TRIGGER, POST_AGGREGATED};
use super::consumer::{ConsumerSettings, GroupConsumer};
use super::merge::merge_post;
use super::retry::RetryPolicy;
use super::rules::RuleSet;
use crate::db::{ProgressStore, RecordStore, StoreError};
use crate::models::dead_letter::FailureKind;
use crate::models::post::AggregatedPost;
use crate::models::progress::{AggregationTrigger, TriggerReason};

pub const AGGREGATOR_GROUP: &str = "aggregator";
const DEAD_LETTER_SOURCE: &str = "aggregation";

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No progress or results for post `{0}`")]
    UnknownPost(String),
}

impl AggregateError {
    /// Infrastructure failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, AggregateError::UnknownPost(_))
    }
}

/// Load → merge → upsert → publish for one post.
pub struct Aggregator {
    bus: Arc<dyn MessageBus>,
    progress: Arc<dyn ProgressStore>,
    records: Arc<dyn RecordStore>,
    rules: Arc<RuleSet>,
}

impl Aggregator {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        progress: Arc<dyn ProgressStore>,
        records: Arc<dyn RecordStore>,
        rules: Arc<RuleSet>,
    ) -> Self {
        Self {
            bus,
            progress,
            records,
            rules,
        }
    }

    /// Merge the post's current results and publish the record.
    ///
    /// Re-running with unchanged inputs produces the same record. The
    /// stored record is always replaced with the latest merge.
    pub async fn aggregate(
        &self,
        post_id: &str,
        reason: TriggerReason,
    ) -> Result<AggregatedPost, AggregateError> {
        let started = Instant::now();
        let progress = self.progress.get(post_id).await?;
        let results = self.records.stage_results(post_id).await?;
        if progress.is_none() && results.is_empty() {
            return Err(AggregateError::UnknownPost(post_id.to_string()));
        }

        let post = merge_post(post_id, progress.as_ref(), &results, &self.rules);

        self.records.upsert_post(&post).await?;
        self.bus.publish_json(POST_AGGREGATED, &post).await?;

        if progress.is_some() && !post.partial {
            self.progress.mark_aggregated(post_id).await?;
        }

        metrics::counter!(
            "aggregations_total",
            "reason" => reason.to_string(),
            "partial" => post.partial.to_string()
        )
        .increment(1);
        metrics::histogram!("aggregation_seconds").record(started.elapsed().as_secs_f64());

        tracing::info!(
            post_id = %post_id,
            reason = %reason,
            results = results.len(),
            images = post.source_image_count,
            expected_images = post.expected_image_count,
            partial = post.partial,
            is_safe = post.is_safe,
            event_type = post.inferred_event_type.as_deref().unwrap_or("-"),
            "Post aggregated"
        );

        Ok(post)
    }
}

/// Consumer of the aggregation-trigger channel.
pub struct AggregatorConsumer {
    consumer: GroupConsumer,
    aggregator: Aggregator,
    retry: RetryPolicy,
    reclaim_interval: Duration,
}

impl AggregatorConsumer {
    pub fn new(
        aggregator: Aggregator,
        bus: Arc<dyn MessageBus>,
        consumer: impl Into<String>,
        settings: ConsumerSettings,
        retry: RetryPolicy,
        reclaim_interval: Duration,
    ) -> Self {
        Self {
            consumer: GroupConsumer::new(
                bus,
                AGGREGATION_TRIGGER,
                AGGREGATOR_GROUP,
                consumer,
                DEAD_LETTER_SOURCE,
                settings,
            ),
            aggregator,
            retry,
            reclaim_interval,
        }
    }

    pub async fn start(&self) -> Result<(), BusError> {
        self.consumer.start().await
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
        let Some(trigger) = self.consumer.admit::<AggregationTrigger>(&delivery).await? else {
            return Ok(());
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.aggregator.aggregate(&trigger.post_id, trigger.reason).await {
                Ok(_) => return self.consumer.ack(&delivery).await,
                Err(e) => e,
            };

            if !error.is_transient() {
                return self
                    .consumer
                    .reject(&delivery, FailureKind::Permanent, error.to_string(), attempt)
                    .await;
            }
            if !self.retry.allows_retry(attempt) {
                return self
                    .consumer
                    .reject(&delivery, FailureKind::RetriesExhausted, error.to_string(), attempt)
                    .await;
            }

            let delay = self.retry.delay_after(attempt);
            tracing::warn!(
                post_id = %trigger.post_id,
                attempt,
                max_attempts = self.retry.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Aggregation failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "Failed to create aggregator consumer group");
        }
        tracing::info!("Aggregator started");

        let mut last_reclaim = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.process_batch() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Aggregator batch failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            if last_reclaim.elapsed() >= self.reclaim_interval {
                last_reclaim = Instant::now();
                if let Err(e) = self.reclaim().await {
                    tracing::error!(error = %e, "Aggregator reclaim failed");
                }
            }
        }
        tracing::info!("Aggregator stopped");
    }
}
