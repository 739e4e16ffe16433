use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use std::str::FromStr;

use super::{ProgressStore, RecordStore, StoreError};
use crate::models::post::AggregatedPost;
use crate::models::progress::{CompletedPair, PostProgress, ProgressStatus};
use crate::models::stage::{Stage, StagePayload, StageResult};

const PROGRESS_COLUMNS: &str =
    "post_id, expected_image_ids, expected_stages, completed, status, created_at, updated_at";

/// Postgres read model.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(post_id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        post_id: post_id.to_string(),
        reason: reason.into(),
    }
}

fn progress_from_row(row: &PgRow) -> Result<PostProgress, StoreError> {
    let post_id: String = row.try_get("post_id")?;
    let expected_image_ids: Vec<String> = row.try_get("expected_image_ids")?;
    let expected_stages: Vec<String> = row.try_get("expected_stages")?;
    let completed: Vec<String> = row.try_get("completed")?;
    let status: String = row.try_get("status")?;

    let expected_stages = expected_stages
        .iter()
        .map(|s| Stage::from_str(s).map_err(|_| corrupt(&post_id, format!("unknown stage `{s}`"))))
        .collect::<Result<BTreeSet<_>, _>>()?;
    let completed = completed
        .iter()
        .map(|k| {
            CompletedPair::parse_key(k)
                .ok_or_else(|| corrupt(&post_id, format!("bad completion key `{k}`")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;
    let status = ProgressStatus::from_str(&status)
        .map_err(|_| corrupt(&post_id, format!("unknown status `{status}`")))?;

    Ok(PostProgress {
        expected_image_ids: expected_image_ids.into_iter().collect(),
        expected_stages,
        completed,
        status,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        post_id,
    })
}

#[async_trait]
impl ProgressStore for PgStore {
    async fn register(&self, progress: &PostProgress) -> Result<(), StoreError> {
        let images: Vec<String> = progress.expected_image_ids.iter().cloned().collect();
        let stages: Vec<String> = progress.expected_stages.iter().map(|s| s.to_string()).collect();
        let expected_keys: Vec<String> = progress
            .missing()
            .iter()
            .chain(progress.completed.iter())
            .map(CompletedPair::key)
            .collect();

        // Re-registering keeps only completions that are still expected.
        sqlx::query(
            r#"
            INSERT INTO post_progress (post_id, expected_image_ids, expected_stages, status)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (post_id) DO UPDATE
            SET expected_image_ids = EXCLUDED.expected_image_ids,
                expected_stages = EXCLUDED.expected_stages,
                completed = ARRAY(
                    SELECT unnest(post_progress.completed)
                    INTERSECT
                    SELECT unnest($4::text[])
                ),
                status = 'pending',
                updated_at = NOW()
            "#,
        )
        .bind(&progress.post_id)
        .bind(&images)
        .bind(&stages)
        .bind(&expected_keys)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_complete(
        &self,
        post_id: &str,
        image_id: &str,
        stage: Stage,
    ) -> Result<Option<PostProgress>, StoreError> {
        let key = CompletedPair::new(image_id, stage).key();

        // Single-statement upsert: the row lock serializes concurrent marks.
        let row = sqlx::query(&format!(
            r#"
            UPDATE post_progress
            SET completed = CASE
                    WHEN $2 = ANY(completed) THEN completed
                    ELSE array_append(completed, $2)
                END,
                updated_at = NOW()
            WHERE post_id = $1
              AND $3 = ANY(expected_image_ids)
              AND $4 = ANY(expected_stages)
            RETURNING {PROGRESS_COLUMNS}
            "#
        ))
        .bind(post_id)
        .bind(&key)
        .bind(image_id)
        .bind(stage.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(progress_from_row).transpose()
    }

    async fn get(&self, post_id: &str) -> Result<Option<PostProgress>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM post_progress WHERE post_id = $1"
        ))
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(progress_from_row).transpose()
    }

    async fn stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostProgress>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROGRESS_COLUMNS}
            FROM post_progress
            WHERE status = 'pending'
              AND created_at < $1
              AND (
                  SELECT count(*)
                  FROM unnest(completed) AS key
                  WHERE regexp_replace(key, '/[^/]*$', '') = ANY(expected_image_ids)
                    AND substring(key FROM '[^/]*$') = ANY(expected_stages)
              ) < cardinality(expected_image_ids) * cardinality(expected_stages)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(progress_from_row).collect()
    }

    async fn mark_partial(&self, post_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE post_progress
            SET status = 'partial', updated_at = NOW()
            WHERE post_id = $1 AND status = 'pending'
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_aggregated(&self, post_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE post_progress
            SET status = 'aggregated', updated_at = NOW()
            WHERE post_id = $1
            "#,
        )
        .bind(post_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, post_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM post_progress WHERE post_id = $1")
            .bind(post_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn insert_stage_result(&self, result: &StageResult) -> Result<bool, StoreError> {
        let payload = serde_json::to_value(&result.payload)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO stage_results
                (post_id, image_id, stage, produced_at, correlation_id, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (post_id, image_id, stage, produced_at) DO NOTHING
            "#,
        )
        .bind(&result.post_id)
        .bind(&result.image_id)
        .bind(result.stage.as_ref())
        .bind(result.produced_at)
        .bind(result.correlation_id)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() == 1)
    }

    async fn stage_results(&self, post_id: &str) -> Result<Vec<StageResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT post_id, image_id, stage, produced_at, correlation_id, payload
            FROM stage_results
            WHERE post_id = $1
            ORDER BY image_id, stage, produced_at
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let stage: String = r.try_get("stage")?;
                let stage = Stage::from_str(&stage)
                    .map_err(|_| corrupt(post_id, format!("unknown stage `{stage}`")))?;
                let payload: serde_json::Value = r.try_get("payload")?;
                let payload: StagePayload = serde_json::from_value(payload)?;
                Ok(StageResult {
                    post_id: r.try_get("post_id")?,
                    image_id: r.try_get("image_id")?,
                    stage,
                    payload,
                    produced_at: r.try_get("produced_at")?,
                    correlation_id: r.try_get("correlation_id")?,
                })
            })
            .collect()
    }

    async fn upsert_post(&self, post: &AggregatedPost) -> Result<(), StoreError> {
        let record = serde_json::to_value(post)?;

        sqlx::query(
            r#"
            INSERT INTO aggregated_posts (post_id, record, partial, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (post_id) DO UPDATE
            SET record = EXCLUDED.record,
                partial = EXCLUDED.partial,
                updated_at = NOW()
            "#,
        )
        .bind(&post.post_id)
        .bind(record)
        .bind(post.partial)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn post(&self, post_id: &str) -> Result<Option<AggregatedPost>, StoreError> {
        let row = sqlx::query("SELECT record FROM aggregated_posts WHERE post_id = $1")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let record: serde_json::Value = r.try_get("record")?;
                Ok(Some(serde_json::from_value(record)?))
            }
            None => Ok(None),
        }
    }

    async fn delete_post(&self, post_id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let results = sqlx::query("DELETE FROM stage_results WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;
        let posts = sqlx::query("DELETE FROM aggregated_posts WHERE post_id = $1")
            .bind(post_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(results.rows_affected() + posts.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
