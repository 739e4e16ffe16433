//! Fan-in merge: stage results for one post → one [`AggregatedPost`].
//!
//! The merge is a pure function of its inputs. Results are deduplicated and
//! keyed into ordered maps before anything is combined, so arrival order and
//! redelivered copies never change the output.

use std::collections::{BTreeMap, BTreeSet};

use crate::models::post::{AggregatedPost, GENERAL_EVENT_TYPE};
use crate::models::progress::PostProgress;
use crate::models::stage::{Stage, StagePayload, StageResult};

use super::rules::RuleSet;

/// Case- and whitespace-normalize a tag, scene or rule term:
/// `"  Conference   Room "` → `"conference_room"`.
pub fn normalize_label(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Keep one result per `(image, stage)`: the latest `produced_at`. Equal
/// timestamps fall back to the serialized payload so the winner never depends
/// on input order. Results whose stage disagrees with their payload are
/// dropped.
pub fn latest_results<'a>(
    post_id: &str,
    results: &'a [StageResult],
) -> BTreeMap<(&'a str, Stage), &'a StageResult> {
    let mut latest: BTreeMap<(&str, Stage), &StageResult> = BTreeMap::new();
    for result in results {
        if result.post_id != post_id || !result.is_consistent() {
            continue;
        }
        let key = (result.image_id.as_str(), result.stage);
        match latest.get(&key) {
            Some(current) if !supersedes(result, current) => {}
            _ => {
                latest.insert(key, result);
            }
        }
    }
    latest
}

fn supersedes(candidate: &StageResult, current: &StageResult) -> bool {
    match candidate.produced_at.cmp(&current.produced_at) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => {
            let a = serde_json::to_string(&candidate.payload).unwrap_or_default();
            let b = serde_json::to_string(&current.payload).unwrap_or_default();
            a > b
        }
    }
}

fn push_labels(into: &mut BTreeSet<String>, labels: &[String]) {
    into.extend(
        labels
            .iter()
            .map(|l| normalize_label(l))
            .filter(|l| !l.is_empty()),
    );
}

/// Merge the current results of a post.
///
/// `progress` supplies the expected image and stage sets; results for pairs
/// it does not expect are ignored. Without it the observed results define
/// the expectation.
pub fn merge_post(
    post_id: &str,
    progress: Option<&PostProgress>,
    results: &[StageResult],
    rules: &RuleSet,
) -> AggregatedPost {
    let latest: BTreeMap<_, _> = latest_results(post_id, results)
        .into_iter()
        .filter(|((image_id, stage), _)| progress.map_or(true, |p| p.is_expected(image_id, *stage)))
        .collect();

    let mut tags = BTreeSet::new();
    let mut scenes = BTreeSet::new();
    let mut total_faces: u32 = 0;
    let mut moderated: BTreeMap<&str, bool> = BTreeMap::new();
    let mut captions: Vec<String> = Vec::new();
    let mut images: BTreeSet<&str> = BTreeSet::new();
    let mut coverage: BTreeMap<Stage, u32> = progress
        .map(|p| p.expected_stages.iter().map(|s| (*s, 0)).collect())
        .unwrap_or_default();

    // `latest` iterates by (image_id, stage), which fixes caption order.
    for ((image_id, stage), result) in &latest {
        images.insert(*image_id);
        *coverage.entry(*stage).or_insert(0) += 1;

        match &result.payload {
            StagePayload::Moderation { is_safe, .. } => {
                moderated.insert(*image_id, *is_safe);
            }
            StagePayload::Tagging { tags: t } => push_labels(&mut tags, t),
            StagePayload::Scene { scenes: s } => push_labels(&mut scenes, s),
            StagePayload::Caption { caption } => {
                let caption = caption.trim();
                if !caption.is_empty() && !captions.iter().any(|c| c == caption) {
                    captions.push(caption.to_string());
                }
            }
            StagePayload::Face { faces } => {
                total_faces = total_faces.saturating_add(faces.len() as u32);
            }
        }
    }

    let expected_images: BTreeSet<&str> = match progress {
        Some(p) => p.expected_image_ids.iter().map(String::as_str).collect(),
        None => images.clone(),
    };
    let moderation_expected = progress.map_or(!moderated.is_empty(), |p| {
        p.expected_stages.contains(&Stage::Moderation)
    });

    // An image without a verdict is not known to be safe.
    let is_safe = moderated.values().all(|safe| *safe)
        && (!moderation_expected || expected_images.iter().all(|i| moderated.contains_key(i)));

    let (inferred_event_type, inferred_tags) = if is_safe {
        let vocabulary: BTreeSet<String> = tags.union(&scenes).cloned().collect();
        match rules.infer(&vocabulary) {
            Some(rule) => (Some(rule.event_type.clone()), rule.enhanced_tags.clone()),
            None => (Some(GENERAL_EVENT_TYPE.to_string()), Vec::new()),
        }
    } else {
        (None, Vec::new())
    };

    let expected_image_count = expected_images.len() as u32;
    let partial = match progress {
        Some(p) => coverage
            .iter()
            .any(|(stage, n)| p.expected_stages.contains(stage) && *n < expected_image_count),
        None => false,
    };

    AggregatedPost {
        post_id: post_id.to_string(),
        union_tags: tags.into_iter().collect(),
        union_scenes: scenes.into_iter().collect(),
        total_faces,
        is_safe,
        inferred_event_type,
        inferred_tags,
        combined_caption: (!captions.is_empty()).then(|| captions.join(" ")),
        source_image_count: images.len() as u32,
        expected_image_count,
        stage_coverage: coverage,
        partial,
    }
}
