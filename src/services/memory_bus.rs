use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::bus::{BusError, Delivery, MessageBus, MessageId, PendingEntry};

/// In-process [`MessageBus`] with the same consumer-group semantics as the
/// Redis implementation. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryBus {
    channels: Mutex<HashMap<String, ChannelLog>>,
    published: Notify,
}

#[derive(Default)]
struct ChannelLog {
    entries: Vec<(MessageId, serde_json::Value)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Index of the first entry never delivered to this group.
    cursor: usize,
    /// Entry index -> delivery state.
    pending: BTreeMap<usize, PendingState>,
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

impl ChannelLog {
    fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|(entry_id, _)| entry_id == id)
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelLog>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every message ever published on `channel`, in order, regardless of
    /// delivery state.
    pub fn messages(&self, channel: &str) -> Vec<serde_json::Value> {
        self.lock()
            .get(channel)
            .map(|log| log.entries.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default()
    }

    fn take_batch(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Vec<Delivery> {
        let mut channels = self.lock();
        let log = channels.entry(channel.to_string()).or_default();
        let total = log.entries.len();
        let state = log.groups.entry(group.to_string()).or_default();

        let end = (state.cursor + batch_size.max(1)).min(total);
        let now = Instant::now();
        let mut batch = Vec::new();
        for index in state.cursor..end {
            state.pending.insert(
                index,
                PendingState {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            let (id, payload) = &log.entries[index];
            batch.push(Delivery {
                id: id.clone(),
                payload: payload.clone(),
                delivery_count: 1,
            });
        }
        state.cursor = end;
        batch
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<MessageId, BusError> {
        let id = {
            let mut channels = self.lock();
            let log = channels.entry(channel.to_string()).or_default();
            let id = format!("{}-0", log.entries.len() + 1);
            log.entries.push((id.clone(), message.clone()));
            id
        };
        self.published.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, channel: &str, group: &str) -> Result<(), BusError> {
        self.lock()
            .entry(channel.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn consume(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_timeout: Duration,
    ) -> Result<Vec<Delivery>, BusError> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_batch(channel, group, consumer, batch_size);
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, channel: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut channels = self.lock();
        if let Some(log) = channels.get_mut(channel) {
            if let Some(index) = log.index_of(id) {
                if let Some(state) = log.groups.get_mut(group) {
                    state.pending.remove(&index);
                }
            }
        }
        Ok(())
    }

    async fn pending(&self, channel: &str, group: &str) -> Result<Vec<PendingEntry>, BusError> {
        let channels = self.lock();
        let Some(log) = channels.get(channel) else {
            return Ok(Vec::new());
        };
        let Some(state) = log.groups.get(group) else {
            return Ok(Vec::new());
        };
        let now = Instant::now();
        Ok(state
            .pending
            .iter()
            .map(|(index, p)| PendingEntry {
                id: log.entries[*index].0.clone(),
                consumer: p.consumer.clone(),
                idle_ms: now.duration_since(p.delivered_at).as_millis() as u64,
                delivery_count: p.delivery_count,
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
        let mut channels = self.lock();
        let Some(log) = channels.get_mut(channel) else {
            return Ok(None);
        };
        let Some(index) = log.index_of(id) else {
            return Ok(None);
        };
        let payload = log.entries[index].1.clone();
        let Some(state) = log.groups.get_mut(group) else {
            return Ok(None);
        };
        let Some(pending) = state.pending.get_mut(&index) else {
            return Ok(None);
        };

        let now = Instant::now();
        if now.duration_since(pending.delivered_at) < min_idle {
            return Ok(None);
        }
        pending.consumer = new_consumer.to_string();
        pending.delivered_at = now;
        pending.delivery_count += 1;

        Ok(Some(Delivery {
            id: id.to_string(),
            payload,
            delivery_count: pending.delivery_count,
        }))
    }

    async fn health_check(&self) -> Result<(), BusError> {
        Ok(())
    }
}
