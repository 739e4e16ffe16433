use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Machine-readable cause recorded with every dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Transient failures hit the attempt ceiling.
    RetriesExhausted,
    /// Collaborator rejected the input (4xx) or returned an unusable payload.
    Permanent,
    /// Message did not match the channel's schema.
    Malformed,
    /// Redelivered more times than allowed.
    Poison,
}

/// A message that exhausted its processing policy, kept for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Channel the original message was read from; replay republishes there.
    pub origin_channel: String,
    pub consumer_group: String,
    pub original_message: serde_json::Value,
    pub failure_kind: FailureKind,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        origin_channel: impl Into<String>,
        consumer_group: impl Into<String>,
        original_message: serde_json::Value,
        failure_kind: FailureKind,
        failure_reason: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            origin_channel: origin_channel.into(),
            consumer_group: consumer_group.into(),
            original_message,
            failure_kind,
            failure_reason: failure_reason.into(),
            attempt_count,
            last_attempt_at: Utc::now(),
        }
    }
}
