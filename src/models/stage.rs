use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

/// One independent analysis pass over an image.
///
/// Declaration order is the canonical ordering used wherever stages are
/// sorted (coverage maps, progress keys).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Moderation,
    Tagging,
    Scene,
    Caption,
    Face,
}

impl Stage {
    /// Consumer group name used by this stage's workers on the image-jobs channel.
    pub fn consumer_group(&self) -> String {
        format!("stage-{}", self)
    }
}

/// Axis-aligned face box in normalized image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

/// Normalized output of one stage, one variant per known stage kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Moderation {
        is_safe: bool,
        confidence: f64,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        categories: Vec<String>,
    },
    Tagging {
        tags: Vec<String>,
    },
    Scene {
        scenes: Vec<String>,
    },
    Caption {
        caption: String,
    },
    Face {
        faces: Vec<DetectedFace>,
    },
}

impl StagePayload {
    /// The stage that produces this kind of payload.
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Moderation { .. } => Stage::Moderation,
            StagePayload::Tagging { .. } => Stage::Tagging,
            StagePayload::Scene { .. } => Stage::Scene,
            StagePayload::Caption { .. } => Stage::Caption,
            StagePayload::Face { .. } => Stage::Face,
        }
    }
}

/// One stage's output for one image, published on the stage-results channel.
///
/// Immutable once produced. Redelivery may yield several results for the same
/// `(post_id, image_id, stage)`; the one with the latest `produced_at` wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub post_id: String,
    pub image_id: String,
    pub stage: Stage,
    pub payload: StagePayload,
    pub produced_at: DateTime<Utc>,
    pub correlation_id: Uuid,
}

impl StageResult {
    /// Rejects results whose declared stage disagrees with the payload kind.
    pub fn is_consistent(&self) -> bool {
        self.stage == self.payload.stage()
    }

    /// Natural identity used for sync pointers and deduplication.
    pub fn entity_id(&self) -> String {
        format!("{}/{}/{}", self.post_id, self.image_id, self.stage)
    }
}
