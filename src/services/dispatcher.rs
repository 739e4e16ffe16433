use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use super::bus::{BusError, MessageBus, AGGREGATION_TRIGGER, IMAGE_JOBS};
use crate::db::{ProgressStore, StoreError};
use crate::models::api::{DispatchRequest, DispatchResponse};
use crate::models::job::ImageJob;
use crate::models::progress::{AggregationTrigger, PostProgress, TriggerReason};
use crate::models::stage::Stage;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Duplicate image id `{0}`")]
    DuplicateImage(String),
}

/// Splits a post into one [`ImageJob`] per image on the shared image-jobs
/// channel. Every stage reads that channel through its own consumer group,
/// so dispatch is O(images) whatever the number of stages.
pub struct JobDispatcher {
    bus: Arc<dyn MessageBus>,
    progress: Arc<dyn ProgressStore>,
    stages: BTreeSet<Stage>,
}

impl JobDispatcher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        progress: Arc<dyn ProgressStore>,
        stages: BTreeSet<Stage>,
    ) -> Self {
        Self {
            bus,
            progress,
            stages,
        }
    }

    /// Register the post's expected pairs, then publish its jobs.
    ///
    /// Progress is written first so the tracker never sees a result for an
    /// unknown post. Re-dispatching a post refreshes its expectations and
    /// republishes every job; downstream dedup absorbs the duplicates.
    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchResponse, DispatchError> {
        let mut image_ids = BTreeSet::new();
        for image in &request.images {
            if !image_ids.insert(image.image_id.clone()) {
                return Err(DispatchError::DuplicateImage(image.image_id.clone()));
            }
        }

        let progress = PostProgress::new(&request.post_id, image_ids, self.stages.clone());
        let expected_pairs = progress.expected_count();
        self.progress.register(&progress).await?;

        let correlation_id = Uuid::new_v4();

        for image in &request.images {
            let job = ImageJob {
                post_id: request.post_id.clone(),
                image_id: image.image_id.clone(),
                image_url: image.image_url.clone(),
                uploader_id: request.uploader_id.clone(),
                correlation_id,
                target_stage: None,
            };
            let message_id = self.bus.publish_json(IMAGE_JOBS, &job).await?;
            tracing::debug!(
                post_id = %job.post_id,
                image_id = %job.image_id,
                message_id = %message_id,
                "Image job published"
            );
        }
        metrics::counter!("image_jobs_published_total").increment(request.images.len() as u64);

        // Nothing will ever report for an image-less post.
        if request.images.is_empty() {
            let trigger = AggregationTrigger::new(&request.post_id, TriggerReason::Complete);
            self.bus.publish_json(AGGREGATION_TRIGGER, &trigger).await?;
        }

        tracing::info!(
            post_id = %request.post_id,
            correlation_id = %correlation_id,
            images = request.images.len(),
            stages = self.stages.len(),
            "Post dispatched"
        );

        Ok(DispatchResponse {
            post_id: request.post_id.clone(),
            correlation_id,
            jobs_published: request.images.len(),
            expected_pairs,
        })
    }
}
