//! Dead-letter replay: republish failed messages to the channel they came
//! from.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::bus::{dead_letter_channel, BusError, MessageBus};
use crate::models::dead_letter::DeadLetter;
use crate::models::stage::Stage;

pub const REPLAY_GROUP: &str = "replay";

/// Components that dead-letter besides the stage workers.
const COMPONENT_SOURCES: &[&str] = &["aggregation", "tracker", "sync"];

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Unknown dead-letter source `{0}`")]
    UnknownSource(String),
}

pub fn is_dead_letter_source(source: &str) -> bool {
    Stage::from_str(source).is_ok() || COMPONENT_SOURCES.contains(&source)
}

pub struct Replayer {
    bus: Arc<dyn MessageBus>,
}

impl Replayer {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Republish up to `limit` unreplayed dead letters of `source`. Each is
    /// acknowledged in the replay group once its original is back on the
    /// origin channel, so a letter is replayed at most once per success.
    pub async fn replay(&self, source: &str, limit: usize) -> Result<usize, ReplayError> {
        if !is_dead_letter_source(source) {
            return Err(ReplayError::UnknownSource(source.to_string()));
        }
        let channel = dead_letter_channel(source);
        self.bus.ensure_group(&channel, REPLAY_GROUP).await?;

        let consumer = format!("replay-{}", Uuid::new_v4().simple());
        let deliveries = self
            .bus
            .consume(&channel, REPLAY_GROUP, &consumer, limit.max(1), Duration::ZERO)
            .await?;

        let mut replayed = 0;
        for delivery in deliveries {
            match delivery.decode::<DeadLetter>() {
                Ok(letter) => {
                    let id = self
                        .bus
                        .publish(&letter.origin_channel, &letter.original_message)
                        .await?;
                    tracing::info!(
                        source = %source,
                        origin_channel = %letter.origin_channel,
                        failure_kind = %letter.failure_kind,
                        message_id = %id,
                        "Dead letter replayed"
                    );
                    replayed += 1;
                }
                Err(e) => {
                    tracing::error!(
                        source = %source,
                        message_id = %delivery.id,
                        error = %e,
                        "Unreadable dead letter skipped"
                    );
                }
            }
            self.bus.ack(&channel, REPLAY_GROUP, &delivery.id).await?;
        }

        metrics::counter!("dead_letters_replayed_total", "source" => source.to_string())
            .increment(replayed as u64);
        Ok(replayed)
    }
}
