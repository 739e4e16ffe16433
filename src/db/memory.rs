use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ProgressStore, RecordStore, StoreError};
use crate::models::post::AggregatedPost;
use crate::models::progress::{PostProgress, ProgressStatus};
use crate::models::stage::{Stage, StageResult};

/// In-process read model used by tests and single-process runs. Each
/// operation holds the lock for its whole read-modify-write, matching the
/// per-row atomicity of the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    progress: Mutex<HashMap<String, PostProgress>>,
    results: Mutex<HashMap<String, Vec<StageResult>>>,
    posts: Mutex<HashMap<String, AggregatedPost>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn register(&self, progress: &PostProgress) -> Result<(), StoreError> {
        let mut map = lock(&self.progress);
        match map.get_mut(&progress.post_id) {
            Some(existing) => existing.reset_expectations(
                progress.expected_image_ids.clone(),
                progress.expected_stages.clone(),
            ),
            None => {
                map.insert(progress.post_id.clone(), progress.clone());
            }
        }
        Ok(())
    }

    async fn mark_complete(
        &self,
        post_id: &str,
        image_id: &str,
        stage: Stage,
    ) -> Result<Option<PostProgress>, StoreError> {
        let mut map = lock(&self.progress);
        let Some(progress) = map.get_mut(post_id) else {
            return Ok(None);
        };
        if !progress.is_expected(image_id, stage) {
            return Ok(None);
        }
        progress.mark(image_id, stage);
        Ok(Some(progress.clone()))
    }

    async fn get(&self, post_id: &str) -> Result<Option<PostProgress>, StoreError> {
        Ok(lock(&self.progress).get(post_id).cloned())
    }

    async fn stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostProgress>, StoreError> {
        let mut stale: Vec<PostProgress> = lock(&self.progress)
            .values()
            .filter(|p| p.is_stale(cutoff))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.post_id.cmp(&b.post_id)));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn mark_partial(&self, post_id: &str) -> Result<bool, StoreError> {
        let mut map = lock(&self.progress);
        match map.get_mut(post_id) {
            Some(p) if p.status == ProgressStatus::Pending => {
                p.status = ProgressStatus::Partial;
                p.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_aggregated(&self, post_id: &str) -> Result<(), StoreError> {
        if let Some(p) = lock(&self.progress).get_mut(post_id) {
            p.status = ProgressStatus::Aggregated;
            p.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete(&self, post_id: &str) -> Result<bool, StoreError> {
        Ok(lock(&self.progress).remove(post_id).is_some())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_stage_result(&self, result: &StageResult) -> Result<bool, StoreError> {
        let mut map = lock(&self.results);
        let rows = map.entry(result.post_id.clone()).or_default();
        let duplicate = rows.iter().any(|r| {
            r.image_id == result.image_id
                && r.stage == result.stage
                && r.produced_at == result.produced_at
        });
        if duplicate {
            return Ok(false);
        }
        rows.push(result.clone());
        Ok(true)
    }

    async fn stage_results(&self, post_id: &str) -> Result<Vec<StageResult>, StoreError> {
        Ok(lock(&self.results).get(post_id).cloned().unwrap_or_default())
    }

    async fn upsert_post(&self, post: &AggregatedPost) -> Result<(), StoreError> {
        lock(&self.posts).insert(post.post_id.clone(), post.clone());
        Ok(())
    }

    async fn post(&self, post_id: &str) -> Result<Option<AggregatedPost>, StoreError> {
        Ok(lock(&self.posts).get(post_id).cloned())
    }

    async fn delete_post(&self, post_id: &str) -> Result<bool, StoreError> {
        let results = lock(&self.results).remove(post_id).is_some();
        let post = lock(&self.posts).remove(post_id).is_some();
        Ok(results || post)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::stage::StagePayload;
    use chrono::Duration;
    use std::collections::{BTreeMap, BTreeSet};
    use uuid::Uuid;

    fn progress(post_id: &str) -> PostProgress {
        PostProgress::new(
            post_id,
            BTreeSet::from(["a".to_string()]),
            BTreeSet::from([Stage::Tagging, Stage::Caption]),
        )
    }

    fn post(partial: bool, tags: &[&str]) -> AggregatedPost {
        AggregatedPost {
            post_id: "p".to_string(),
            union_tags: tags.iter().map(|t| t.to_string()).collect(),
            union_scenes: vec![],
            total_faces: 0,
            is_safe: true,
            inferred_event_type: Some("general".to_string()),
            inferred_tags: vec![],
            combined_caption: None,
            source_image_count: 1,
            expected_image_count: 1,
            stage_coverage: BTreeMap::new(),
            partial,
        }
    }

    #[tokio::test]
    async fn test_mark_complete_unknown_post_and_unexpected_pair() {
        let store = MemoryStore::new();
        assert!(store.mark_complete("nope", "a", Stage::Tagging).await.unwrap().is_none());

        store.register(&progress("p")).await.unwrap();
        assert!(store.mark_complete("p", "z", Stage::Tagging).await.unwrap().is_none());
        let snapshot = store.mark_complete("p", "a", Stage::Tagging).await.unwrap().unwrap();
        assert_eq!(snapshot.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_reregister_preserves_completions() {
        let store = MemoryStore::new();
        store.register(&progress("p")).await.unwrap();
        store.mark_complete("p", "a", Stage::Tagging).await.unwrap();
        store.mark_aggregated("p").await.unwrap();

        store.register(&progress("p")).await.unwrap();
        let p = store.get("p").await.unwrap().unwrap();
        assert_eq!(p.status, ProgressStatus::Pending);
        assert_eq!(p.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_partial_only_once() {
        let store = MemoryStore::new();
        store.register(&progress("p")).await.unwrap();
        assert!(store.mark_partial("p").await.unwrap());
        assert!(!store.mark_partial("p").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_filters_by_cutoff_and_completion() {
        let store = MemoryStore::new();
        let mut old = progress("old");
        old.created_at = Utc::now() - Duration::hours(1);
        let mut done = progress("done");
        done.created_at = Utc::now() - Duration::hours(1);
        done.mark("a", Stage::Tagging);
        done.mark("a", Stage::Caption);
        store.register(&old).await.unwrap();
        store.register(&done).await.unwrap();
        store.register(&progress("fresh")).await.unwrap();

        let stale = store.stale(Utc::now() - Duration::minutes(5), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].post_id, "old");
    }

    #[tokio::test]
    async fn test_duplicate_stage_result_ignored() {
        let store = MemoryStore::new();
        let result = StageResult {
            post_id: "p".to_string(),
            image_id: "a".to_string(),
            stage: Stage::Caption,
            payload: StagePayload::Caption {
                caption: "hi".to_string(),
            },
            produced_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        };
        assert!(store.insert_stage_result(&result).await.unwrap());
        assert!(!store.insert_stage_result(&result).await.unwrap());

        let mut newer = result.clone();
        newer.produced_at = result.produced_at + Duration::seconds(1);
        assert!(store.insert_stage_result(&newer).await.unwrap());
        assert_eq!(store.stage_results("p").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_last_record_written_wins() {
        let store = MemoryStore::new();
        store.upsert_post(&post(false, &["a"])).await.unwrap();
        store.upsert_post(&post(true, &["a", "b"])).await.unwrap();
        let stored = store.post("p").await.unwrap().unwrap();
        assert!(stored.partial);
        assert_eq!(stored.union_tags, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_register_again_drops_completions_no_longer_expected() {
        let store = MemoryStore::new();
        store
            .register(&PostProgress::new(
                "p",
                BTreeSet::from(["a".to_string(), "b".to_string()]),
                BTreeSet::from([Stage::Tagging]),
            ))
            .await
            .unwrap();
        store.mark_complete("p", "b", Stage::Tagging).await.unwrap();

        store
            .register(&PostProgress::new(
                "p",
                BTreeSet::from(["a".to_string()]),
                BTreeSet::from([Stage::Tagging]),
            ))
            .await
            .unwrap();
        let progress = store.get("p").await.unwrap().unwrap();
        assert_eq!(progress.completed_count(), 0);
        assert!(!progress.is_complete());

        let done = store.mark_complete("p", "a", Stage::Tagging).await.unwrap().unwrap();
        assert!(done.is_complete());
    }
}
