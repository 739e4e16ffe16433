use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumString};

use super::stage::Stage;

/// Lifecycle of a post's completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProgressStatus {
    /// Waiting for stage results.
    Pending,
    /// Stale horizon elapsed; a partial trigger was emitted.
    Partial,
    /// Aggregation succeeded; the record is archived.
    Aggregated,
}

/// One observed `(image, stage)` completion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompletedPair {
    pub image_id: String,
    pub stage: Stage,
}

impl CompletedPair {
    pub fn new(image_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            image_id: image_id.into(),
            stage,
        }
    }

    /// Flat `image/stage` key used by the Postgres text array column.
    pub fn key(&self) -> String {
        format!("{}/{}", self.image_id, self.stage)
    }

    /// Inverse of [`CompletedPair::key`]. Splits on the last `/` since stage
    /// names never contain one but image ids may.
    pub fn parse_key(key: &str) -> Option<Self> {
        let (image_id, stage) = key.rsplit_once('/')?;
        let stage = Stage::from_str(stage).ok()?;
        Some(Self::new(image_id, stage))
    }
}

/// Completion state for a post across all expected `(image, stage)` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProgress {
    pub post_id: String,
    pub expected_image_ids: BTreeSet<String>,
    pub expected_stages: BTreeSet<Stage>,
    pub completed: BTreeSet<CompletedPair>,
    pub status: ProgressStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PostProgress {
    pub fn new(
        post_id: impl Into<String>,
        expected_image_ids: BTreeSet<String>,
        expected_stages: BTreeSet<Stage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            post_id: post_id.into(),
            expected_image_ids,
            expected_stages,
            completed: BTreeSet::new(),
            status: ProgressStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expected(&self, image_id: &str, stage: Stage) -> bool {
        self.expected_image_ids.contains(image_id) && self.expected_stages.contains(&stage)
    }

    /// Records a completion. Returns `true` only when the pair was expected and
    /// not already complete; repeated marks are no-ops.
    pub fn mark(&mut self, image_id: &str, stage: Stage) -> bool {
        if !self.is_expected(image_id, stage) {
            return false;
        }
        let inserted = self.completed.insert(CompletedPair::new(image_id, stage));
        if inserted {
            self.updated_at = Utc::now();
        }
        inserted
    }

    pub fn expected_count(&self) -> usize {
        self.expected_image_ids.len() * self.expected_stages.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Replace the expected sets, dropping completions no longer expected.
    pub fn reset_expectations(
        &mut self,
        expected_image_ids: BTreeSet<String>,
        expected_stages: BTreeSet<Stage>,
    ) {
        self.expected_image_ids = expected_image_ids;
        self.expected_stages = expected_stages;
        let (images, stages) = (&self.expected_image_ids, &self.expected_stages);
        self.completed
            .retain(|pair| images.contains(&pair.image_id) && stages.contains(&pair.stage));
        self.status = ProgressStatus::Pending;
        self.updated_at = Utc::now();
    }

    /// Expected pairs that have not been observed yet, in canonical order.
    pub fn missing(&self) -> Vec<CompletedPair> {
        self.expected_image_ids
            .iter()
            .flat_map(|image_id| {
                self.expected_stages
                    .iter()
                    .map(move |stage| CompletedPair::new(image_id.clone(), *stage))
            })
            .filter(|pair| !self.completed.contains(pair))
            .collect()
    }

    /// Incomplete, still pending and created before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == ProgressStatus::Pending && !self.is_complete() && self.created_at < cutoff
    }
}

/// Why an aggregation pass was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TriggerReason {
    Complete,
    Partial,
    Forced,
}

/// Message on the aggregation-trigger channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTrigger {
    pub post_id: String,
    pub reason: TriggerReason,
    pub requested_at: DateTime<Utc>,
}

impl AggregationTrigger {
    pub fn new(post_id: impl Into<String>, reason: TriggerReason) -> Self {
        Self {
            post_id: post_id.into(),
            reason,
            requested_at: Utc::now(),
        }
    }
}
