use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::post::AggregatedPost;
use crate::models::progress::PostProgress;
use crate::models::stage::{Stage, StageResult};

pub mod memory;
pub mod queries;

pub use memory::MemoryStore;
pub use queries::PgStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt row for post `{post_id}`: {reason}")]
    Corrupt { post_id: String, reason: String },
}

/// Per-post completion state. Every mutation is a single keyed upsert so many
/// workers can report completions concurrently without external locking.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Create the record, or refresh its expectations and reset it to pending.
    /// Completed pairs are preserved.
    async fn register(&self, progress: &PostProgress) -> Result<(), StoreError>;

    /// Atomically add one `(image, stage)` completion and return the updated
    /// record. Returns `None` when the post is unknown or the pair was not
    /// expected. Marking a completed pair again changes nothing.
    async fn mark_complete(
        &self,
        post_id: &str,
        image_id: &str,
        stage: Stage,
    ) -> Result<Option<PostProgress>, StoreError>;

    async fn get(&self, post_id: &str) -> Result<Option<PostProgress>, StoreError>;

    /// Pending, incomplete records created before `cutoff`, oldest first.
    async fn stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PostProgress>, StoreError>;

    /// Move a pending record to `partial`. Returns `false` when another
    /// caller already moved it, so only one partial trigger is emitted.
    async fn mark_partial(&self, post_id: &str) -> Result<bool, StoreError>;

    /// Archive a record after an aggregation over a complete input set.
    async fn mark_aggregated(&self, post_id: &str) -> Result<(), StoreError>;

    async fn delete(&self, post_id: &str) -> Result<bool, StoreError>;
}

/// Stage results and aggregated posts.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a result keyed by `(post, image, stage, produced_at)`. Redelivered
    /// copies are ignored; newer productions are kept alongside older ones.
    /// Returns `true` when the row is new.
    async fn insert_stage_result(&self, result: &StageResult) -> Result<bool, StoreError>;

    async fn stage_results(&self, post_id: &str) -> Result<Vec<StageResult>, StoreError>;

    /// Last write wins; the record is a pure function of current results.
    async fn upsert_post(&self, post: &AggregatedPost) -> Result<(), StoreError>;

    async fn post(&self, post_id: &str) -> Result<Option<AggregatedPost>, StoreError>;

    /// Remove the post's stage results and aggregated record.
    async fn delete_post(&self, post_id: &str) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
