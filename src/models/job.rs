use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::Stage;

/// One image awaiting analysis, published once on the image-jobs channel and
/// read independently by every stage's consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageJob {
    pub post_id: String,
    pub image_id: String,
    pub image_url: String,
    pub uploader_id: String,
    pub correlation_id: Uuid,
    /// Set on jobs replayed from a stage's dead-letter channel so only that
    /// stage reprocesses them. Dispatched jobs leave it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<Stage>,
}

impl ImageJob {
    /// Whether a worker for `stage` should process this job.
    pub fn is_for(&self, stage: Stage) -> bool {
        self.target_stage.map_or(true, |target| target == stage)
    }
}
