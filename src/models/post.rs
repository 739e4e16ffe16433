use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::stage::Stage;

/// Event type assigned when no inference rule matches.
pub const GENERAL_EVENT_TYPE: &str = "general";

/// Merged, enriched post record published on the post-aggregated channel.
///
/// A pure function of the post's current stage results: every collection is
/// sorted and the record carries no timestamps, so re-aggregating unchanged
/// inputs serializes to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPost {
    pub post_id: String,
    pub union_tags: Vec<String>,
    pub union_scenes: Vec<String>,
    pub total_faces: u32,
    pub is_safe: bool,
    /// `None` when the post is unsafe and inference was skipped.
    pub inferred_event_type: Option<String>,
    pub inferred_tags: Vec<String>,
    pub combined_caption: Option<String>,
    /// Distinct images that contributed at least one stage result.
    pub source_image_count: u32,
    pub expected_image_count: u32,
    /// Images with a result, per stage.
    pub stage_coverage: BTreeMap<Stage, u32>,
    /// Set when coverage is below what the post expected.
    pub partial: bool,
}
