//! Durable multi-consumer log abstraction.
//!
//! Channels are append-only logs. Each consumer group reads a channel
//! independently; within a group every message is handed to one consumer at a
//! time and stays pending until acknowledged or reclaimed. Delivery is
//! at-least-once and the bus never retries on its own.

use async_trait::async_trait;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::dead_letter::DeadLetter;

pub const IMAGE_JOBS: &str = "image-jobs";
pub const STAGE_RESULTS: &str = "stage-results";
pub const AGGREGATION_TRIGGER: &str = "aggregation-trigger";
pub const POST_AGGREGATED: &str = "post-aggregated";
pub const SYNC_QUEUE: &str = "sync-queue";

const DEAD_LETTER_SUFFIX: &str = "-dead-letter";
const KEY_PREFIX: &str = "post_enrichment:";
const PAYLOAD_FIELD: &str = "payload";
const PENDING_SCAN_LIMIT: usize = 1_000;

/// Dead-letter channel for a failure source (a stage name or a component).
pub fn dead_letter_channel(source: &str) -> String {
    format!("{source}{DEAD_LETTER_SUFFIX}")
}

pub type MessageId = String;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: MessageId,
    /// Decoded JSON body. Entries that were not valid JSON surface as a JSON
    /// string holding the raw text so they can still be dead-lettered.
    pub payload: serde_json::Value,
    pub delivery_count: u64,
}

impl Delivery {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// One unacknowledged message in a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: MessageId,
    pub consumer: String,
    pub idle_ms: u64,
    pub delivery_count: u64,
}

impl PendingEntry {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Append a message; never waits on consumers.
    async fn publish(&self, channel: &str, message: &serde_json::Value)
        -> Result<MessageId, BusError>;

    /// Create `group` on `channel` starting from the beginning of the log.
    /// Creating an existing group is a no-op.
    async fn ensure_group(&self, channel: &str, group: &str) -> Result<(), BusError>;

    /// Read up to `batch_size` never-delivered messages for `group`, blocking
    /// up to `block_timeout` when none are available.
    async fn consume(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError>;

    /// Remove a message from the group's pending set.
    async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), BusError>;

    async fn pending(&self, channel: &str, group: &str) -> Result<Vec<PendingEntry>, BusError>;

    /// Reassign a pending message idle for at least `min_idle` to
    /// `new_consumer`. Returns `None` when the message is no longer claimable.
    async fn claim(
        &self,
        channel: &str,
        group: &str,
        id: &str,
        new_consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, BusError>;

    async fn health_check(&self) -> Result<(), BusError>;

    /// Publish a failure record on the dead-letter channel of `source`.
    async fn dead_letter(&self, source: &str, letter: &DeadLetter) -> Result<MessageId, BusError> {
        let message = serde_json::to_value(letter)?;
        self.publish(&dead_letter_channel(source), &message).await
    }
}

impl dyn MessageBus {
    /// Serialize and publish a typed message.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        channel: &str,
        message: &T,
    ) -> Result<MessageId, BusError> {
        let value = serde_json::to_value(message)?;
        self.publish(channel, &value).await
    }
}

/// Redis Streams backed bus: XADD / XREADGROUP / XACK / XPENDING / XCLAIM.
pub struct RedisStreamBus {
    client: redis::Client,
}

impl RedisStreamBus {
    pub fn new(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }

    // A fresh multiplexed connection per call keeps one consumer's blocking
    // XREADGROUP from stalling other callers.
    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, BusError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn key(channel: &str) -> String {
        format!("{KEY_PREFIX}{channel}")
    }

    fn to_delivery(entry: &StreamId, delivery_count: u64) -> Option<Delivery> {
        let raw: String = entry.get(PAYLOAD_FIELD)?;
        let payload = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
        Some(Delivery {
            id: entry.id.clone(),
            payload,
            delivery_count,
        })
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<MessageId, BusError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(message)?;
        let id: String = conn
            .xadd(Self::key(channel), "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        Ok(id)
    }

    async fn ensure_group(&self, channel: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(Self::key(channel), group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn consume(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let mut conn = self.connection().await?;
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(batch_size.max(1));
        if !block_timeout.is_zero() {
            options = options.block(block_timeout.as_millis() as usize);
        }

        let key = Self::key(channel);
        let reply: Option<StreamReadReply> = conn.xread_options(&[key.as_str()], &[">"], &options).await?;

        let mut deliveries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream.ids {
                match Self::to_delivery(entry, 1) {
                    Some(delivery) => deliveries.push(delivery),
                    None => {
                        tracing::warn!(channel, message_id = %entry.id, "Stream entry has no payload field");
                        deliveries.push(Delivery {
                            id: entry.id.clone(),
                            payload: serde_json::Value::Null,
                            delivery_count: 1,
                        });
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        conn.xack::<_, _, _, ()>(Self::key(channel), group, &[id]).await?;
        Ok(())
    }

    async fn pending(&self, channel: &str, group: &str) -> Result<Vec<PendingEntry>, BusError> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingCountReply = conn
            .xpending_count(Self::key(channel), group, "-", "+", PENDING_SCAN_LIMIT)
            .await?;
        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                id: p.id,
                consumer: p.consumer,
                idle_ms: p.last_delivered_ms as u64,
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        channel: &str,
        group: &str,
        id: &str,
        new_consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, BusError> {
        let mut conn = self.connection().await?;
        let key = Self::key(channel);
        let reply: StreamClaimReply = conn
            .xclaim(&key, group, new_consumer, min_idle.as_millis() as usize, &[id])
            .await?;

        let Some(entry) = reply.ids.first() else {
            return Ok(None);
        };

        // XCLAIM bumps the delivery counter but does not report it.
        let pending: StreamPendingCountReply = conn.xpending_count(&key, group, id, id, 1).await?;
        let delivery_count = pending
            .ids
            .first()
            .map(|p| p.times_delivered as u64)
            .unwrap_or(1);

        match Self::to_delivery(entry, delivery_count) {
            Some(delivery) => Ok(Some(delivery)),
            None => {
                // Entry was trimmed from the stream; nothing left to process.
                conn.xack::<_, _, _, ()>(&key, group, &[id]).await?;
                Ok(None)
            }
        }
    }

    async fn health_check(&self) -> Result<(), BusError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
