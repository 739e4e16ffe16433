//! Stage-specific transforms from raw collaborator responses into
//! [`StagePayload`]s.
//!
//! Collaborators may answer either with the bare object or wrapped in a
//! `{"result": ...}` envelope (Workers AI style); both are accepted.

use serde::Deserialize;

use crate::models::stage::{DetectedFace, Stage, StagePayload};

pub type StageTransform = fn(&serde_json::Value) -> Result<StagePayload, TransformError>;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Response does not match the {stage} schema: {source}")]
    Schema {
        stage: Stage,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {stage} response: {reason}")]
    Invalid { stage: Stage, reason: String },
}

/// Select the transform for a stage.
pub fn transform_for(stage: Stage) -> StageTransform {
    match stage {
        Stage::Moderation => moderation,
        Stage::Tagging => tagging,
        Stage::Scene => scene,
        Stage::Caption => caption,
        Stage::Face => face,
    }
}

/// Labels arrive either as plain strings or as classifier output.
#[derive(Deserialize)]
#[serde(untagged)]
enum LabelEntry {
    Plain(String),
    Scored { label: String },
}

impl LabelEntry {
    fn into_label(self) -> String {
        match self {
            LabelEntry::Plain(label) | LabelEntry::Scored { label } => label,
        }
    }
}

#[derive(Deserialize)]
struct ModerationResponse {
    is_safe: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Deserialize)]
struct TaggingResponse {
    tags: Vec<LabelEntry>,
}

#[derive(Deserialize)]
struct SceneResponse {
    scenes: Vec<LabelEntry>,
}

#[derive(Deserialize)]
struct CaptionResponse {
    #[serde(alias = "description")]
    caption: String,
}

#[derive(Deserialize)]
struct FaceResponse {
    faces: Vec<DetectedFace>,
}

fn unwrap_envelope(raw: &serde_json::Value) -> &serde_json::Value {
    match raw.get("result") {
        Some(inner) if inner.is_object() => inner,
        _ => raw,
    }
}

fn parse<T: for<'de> Deserialize<'de>>(
    stage: Stage,
    raw: &serde_json::Value,
) -> Result<T, TransformError> {
    T::deserialize(unwrap_envelope(raw)).map_err(|source| TransformError::Schema { stage, source })
}

fn labels(entries: Vec<LabelEntry>) -> Vec<String> {
    entries
        .into_iter()
        .map(LabelEntry::into_label)
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn moderation(raw: &serde_json::Value) -> Result<StagePayload, TransformError> {
    let resp: ModerationResponse = parse(Stage::Moderation, raw)?;
    if !(0.0..=1.0).contains(&resp.confidence) {
        return Err(TransformError::Invalid {
            stage: Stage::Moderation,
            reason: format!("confidence {} outside [0, 1]", resp.confidence),
        });
    }
    Ok(StagePayload::Moderation {
        is_safe: resp.is_safe,
        confidence: resp.confidence,
        categories: resp.categories,
    })
}

fn tagging(raw: &serde_json::Value) -> Result<StagePayload, TransformError> {
    let resp: TaggingResponse = parse(Stage::Tagging, raw)?;
    Ok(StagePayload::Tagging {
        tags: labels(resp.tags),
    })
}

fn scene(raw: &serde_json::Value) -> Result<StagePayload, TransformError> {
    let resp: SceneResponse = parse(Stage::Scene, raw)?;
    Ok(StagePayload::Scene {
        scenes: labels(resp.scenes),
    })
}

fn caption(raw: &serde_json::Value) -> Result<StagePayload, TransformError> {
    let resp: CaptionResponse = parse(Stage::Caption, raw)?;
    Ok(StagePayload::Caption {
        caption: resp.caption.trim().to_string(),
    })
}

fn face(raw: &serde_json::Value) -> Result<StagePayload, TransformError> {
    let resp: FaceResponse = parse(Stage::Face, raw)?;
    Ok(StagePayload::Face { faces: resp.faces })
}
