use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::progress::{PostProgress, ProgressStatus, TriggerReason};
use crate::services::bus::PendingEntry;

/// Request to fan a post's images out to the analysis stages.
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct DispatchRequest {
    #[garde(length(min = 1, max = 128))]
    pub post_id: String,

    #[garde(length(min = 1, max = 128))]
    pub uploader_id: String,

    #[garde(length(max = 64), custom(unique_image_ids), dive)]
    pub images: Vec<PostImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PostImage {
    #[garde(length(min = 1, max = 128))]
    pub image_id: String,

    #[garde(length(min = 1, max = 2048), custom(http_url))]
    pub image_url: String,
}

#[allow(clippy::ptr_arg)]
fn unique_image_ids(images: &Vec<PostImage>, _ctx: &()) -> garde::Result {
    let mut seen = HashSet::new();
    for image in images {
        if !seen.insert(image.image_id.as_str()) {
            return Err(garde::Error::new(format!(
                "duplicate image_id `{}`",
                image.image_id
            )));
        }
    }
    Ok(())
}

#[allow(clippy::ptr_arg)]
fn http_url(value: &String, _ctx: &()) -> garde::Result {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(garde::Error::new("image_url must be an http(s) URL"))
    }
}

/// Response after a post has been dispatched.
#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub post_id: String,
    pub correlation_id: uuid::Uuid,
    pub jobs_published: usize,
    pub expected_pairs: usize,
}

/// Response after an explicit aggregation trigger was queued.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub post_id: String,
    pub reason: TriggerReason,
    pub message_id: String,
}

/// Response after replaying dead letters.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub source: String,
    pub replayed: usize,
}

#[derive(Debug, Deserialize)]
pub struct ReplayParams {
    pub limit: Option<usize>,
}

/// Completion snapshot of a post.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressResponse {
    pub post_id: String,
    pub status: ProgressStatus,
    pub expected_pairs: usize,
    pub completed_pairs: usize,
    /// `image/stage` keys still outstanding.
    pub missing: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<PostProgress> for ProgressResponse {
    fn from(p: PostProgress) -> Self {
        Self {
            expected_pairs: p.expected_count(),
            completed_pairs: p.completed_count(),
            missing: p.missing().iter().map(|pair| pair.key()).collect(),
            post_id: p.post_id,
            status: p.status,
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// Backlog of one consumer group.
#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub channel: String,
    pub group: String,
    pub count: usize,
    pub entries: Vec<PendingEntry>,
}
