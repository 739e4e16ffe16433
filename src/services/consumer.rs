//! Consumer-group plumbing shared by the tracker, aggregator and sync
//! consumers: batch reads, idle-entry reclaim, the poison guard and
//! dead-lettering of messages that cannot be decoded.

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::bus::{BusError, Delivery, MessageBus};
use crate::config::AppConfig;
use crate::models::dead_letter::{DeadLetter, FailureKind};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub reclaim_idle: Duration,
    pub max_deliveries: u64,
}

impl ConsumerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            block_timeout: config.block_timeout(),
            reclaim_idle: config.reclaim_idle(),
            max_deliveries: config.max_deliveries,
        }
    }
}

/// One named consumer in a group on one channel.
pub struct GroupConsumer {
    bus: Arc<dyn MessageBus>,
    channel: &'static str,
    group: String,
    consumer: String,
    /// Dead-letter channel source for messages this consumer gives up on.
    source: String,
    settings: ConsumerSettings,
}

impl GroupConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        channel: &'static str,
        group: impl Into<String>,
        consumer: impl Into<String>,
        source: impl Into<String>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            bus,
            channel,
            group: group.into(),
            consumer: consumer.into(),
            source: source.into(),
            settings,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub async fn start(&self) -> Result<(), BusError> {
        self.bus.ensure_group(self.channel, &self.group).await
    }

    pub async fn next_batch(&self) -> Result<Vec<Delivery>, BusError> {
        self.bus
            .consume(
                self.channel,
                &self.group,
                &self.consumer,
                self.settings.batch_size,
                self.settings.block_timeout,
            )
            .await
    }

    /// Claim every entry of the group idle past the reclaim threshold.
    pub async fn reclaim(&self) -> Result<Vec<Delivery>, BusError> {
        let mut claimed = Vec::new();
        for entry in self.bus.pending(self.channel, &self.group).await? {
            if entry.idle() < self.settings.reclaim_idle {
                continue;
            }
            if let Some(delivery) = self
                .bus
                .claim(
                    self.channel,
                    &self.group,
                    &entry.id,
                    &self.consumer,
                    self.settings.reclaim_idle,
                )
                .await?
            {
                tracing::info!(
                    channel = self.channel,
                    group = %self.group,
                    message_id = %delivery.id,
                    previous_consumer = %entry.consumer,
                    delivery_count = delivery.delivery_count,
                    "Reclaimed idle message"
                );
                claimed.push(delivery);
            }
        }
        Ok(claimed)
    }

    /// Decode a delivery, or dead-letter and acknowledge it when it is
    /// poison or does not match `T`. `Ok(None)` means the delivery is done.
    pub async fn admit<T: DeserializeOwned>(&self, delivery: &Delivery) -> Result<Option<T>, BusError> {
        self.admit_with(delivery, |_: &T| delivery.payload.clone())
            .await
    }

    /// Like [`admit`](Self::admit), but a poison letter for a delivery that
    /// still decodes carries `replay(message)` as its original message.
    pub async fn admit_with<T, F>(&self, delivery: &Delivery, replay: F) -> Result<Option<T>, BusError>
    where
        T: DeserializeOwned,
        F: FnOnce(&T) -> serde_json::Value,
    {
        let decoded = delivery.decode::<T>();
        if delivery.delivery_count > self.settings.max_deliveries {
            let original = match &decoded {
                Ok(message) => replay(message),
                Err(_) => delivery.payload.clone(),
            };
            let reason = format!("delivered {} times", delivery.delivery_count);
            self.dead_letter(
                delivery,
                original,
                FailureKind::Poison,
                reason,
                delivery.delivery_count as u32,
            )
            .await?;
            return Ok(None);
        }
        match decoded {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                self.reject(delivery, FailureKind::Malformed, e.to_string(), 0)
                    .await?;
                Ok(None)
            }
        }
    }

    /// Dead-letter a delivery as received, then acknowledge it.
    pub async fn reject(
        &self,
        delivery: &Delivery,
        kind: FailureKind,
        reason: String,
        attempts: u32,
    ) -> Result<(), BusError> {
        self.dead_letter(delivery, delivery.payload.clone(), kind, reason, attempts)
            .await
    }

    /// Dead-letter `original` in place of the delivery, then acknowledge it.
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        original: serde_json::Value,
        kind: FailureKind,
        reason: String,
        attempts: u32,
    ) -> Result<(), BusError> {
        let letter = DeadLetter::new(self.channel, &self.group, original, kind, reason, attempts);
        self.bus.dead_letter(&self.source, &letter).await?;
        tracing::warn!(
            channel = self.channel,
            group = %self.group,
            message_id = %delivery.id,
            failure_kind = %kind,
            attempts,
            reason = %letter.failure_reason,
            "Message dead-lettered"
        );
        self.ack(delivery).await
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        self.bus.ack(self.channel, &self.group, &delivery.id).await
    }
}
