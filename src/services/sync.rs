//! Change notifications for the external indexer.
//!
//! Messages are pointers (entity type + id). The indexer re-reads current
//! state from the read model, so publishing the same pointer twice is
//! harmless.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::bus::{BusError, MessageBus, MessageId, POST_AGGREGATED, SYNC_QUEUE};
use super::consumer::{ConsumerSettings, GroupConsumer};
use crate::models::post::AggregatedPost;
use crate::models::stage::StageResult;
use crate::models::sync::{EntityType, SyncMessage, SyncOperation};

pub const SYNC_GROUP: &str = "sync";
const DEAD_LETTER_SOURCE: &str = "sync";

#[derive(Clone)]
pub struct SyncPropagator {
    bus: Arc<dyn MessageBus>,
}

impl SyncPropagator {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn propagate(
        &self,
        entity_type: EntityType,
        entity_id: impl Into<String>,
        operation: SyncOperation,
    ) -> Result<MessageId, BusError> {
        let message = SyncMessage {
            entity_type,
            entity_id: entity_id.into(),
            operation,
        };
        let id = self.bus.publish_json(SYNC_QUEUE, &message).await?;
        metrics::counter!(
            "sync_messages_published_total",
            "entity_type" => entity_type.to_string(),
            "operation" => operation.to_string()
        )
        .increment(1);
        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %message.entity_id,
            operation = %operation,
            "Sync pointer published"
        );
        Ok(id)
    }

    pub async fn post_updated(&self, post_id: &str) -> Result<MessageId, BusError> {
        self.propagate(EntityType::Post, post_id, SyncOperation::Index)
            .await
    }

    pub async fn post_deleted(&self, post_id: &str) -> Result<MessageId, BusError> {
        self.propagate(EntityType::Post, post_id, SyncOperation::Delete)
            .await
    }

    pub async fn stage_result_updated(&self, result: &StageResult) -> Result<MessageId, BusError> {
        self.propagate(EntityType::StageResult, result.entity_id(), SyncOperation::Index)
            .await
    }
}

/// Turns every aggregated post into an index pointer.
pub struct SyncConsumer {
    consumer: GroupConsumer,
    propagator: SyncPropagator,
    reclaim_interval: Duration,
}

impl SyncConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        consumer: impl Into<String>,
        settings: ConsumerSettings,
        reclaim_interval: Duration,
    ) -> Self {
        Self {
            reclaim_interval,
            propagator: SyncPropagator::new(bus.clone()),
            consumer: GroupConsumer::new(
                bus,
                POST_AGGREGATED,
                SYNC_GROUP,
                consumer,
                DEAD_LETTER_SOURCE,
                settings,
            ),
        }
    }

    pub async fn start(&self) -> Result<(), BusError> {
        self.consumer.start().await
    }

    pub async fn process_batch(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.next_batch().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            let Some(post) = self.consumer.admit::<AggregatedPost>(&delivery).await? else {
                continue;
            };
            self.propagator.post_updated(&post.post_id).await?;
            self.consumer.ack(&delivery).await?;
        }
        Ok(handled)
    }

    pub async fn reclaim(&self) -> Result<usize, BusError> {
        let deliveries = self.consumer.reclaim().await?;
        let handled = deliveries.len();
        for delivery in deliveries {
            if let Some(post) = self.consumer.admit::<AggregatedPost>(&delivery).await? {
                self.propagator.post_updated(&post.post_id).await?;
                self.consumer.ack(&delivery).await?;
            }
        }
        Ok(handled)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.start().await {
            tracing::error!(error = %e, "Failed to create sync consumer group");
        }
        let mut last_reclaim = Instant::now();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.process_batch() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Sync batch failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            if last_reclaim.elapsed() >= self.reclaim_interval {
                last_reclaim = Instant::now();
                if let Err(e) = self.reclaim().await {
                    tracing::error!(error = %e, "Sync reclaim failed");
                }
            }
        }
        tracing::info!("Sync consumer stopped");
    }
}
