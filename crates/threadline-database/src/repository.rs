//! Postgres repositories for posts and credentials.
//!
//! Every post write is a conditional update on `(id, version)`; a mismatch
//! surfaces as `Error::Conflict`, which the pipeline classifies as
//! transient. The execution lock lives in dedicated columns so it can be
//! claimed by a single atomic UPDATE without touching the version counter.

use crate::models::{
    CommentStatus, Credential, ExecutionLock, Post, PostStatus, PostType, PublishingProgress,
    ScheduleConfig,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use threadline_core::error::{Error, ErrorCategory, Result};
use uuid::Uuid;

const POST_COLUMNS: &str = "id, content, post_type, image_urls, video_url, comment, account_id, \
     status, scheduled_at, schedule_config, published_at, platform_post_id, platform_comment_id, \
     comment_status, comment_retry_count, content_hash, publishing_progress, \
     locked_by, locked_at, lock_expires_at, error, error_category, suggested_action, \
     version, created_at, updated_at";

/// Repository for the posts table
#[derive(Clone)]
pub struct PostRepository {
    pool: PgPool,
}

impl PostRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new post
    pub async fn create(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (
                id, content, post_type, image_urls, video_url, comment, account_id,
                status, scheduled_at, schedule_config, published_at, platform_post_id,
                platform_comment_id, comment_status, comment_retry_count, content_hash,
                publishing_progress, locked_by, locked_at, lock_expires_at,
                error, error_category, suggested_action, version, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
            )
            "#,
        )
        .bind(post.id)
        .bind(&post.content)
        .bind(post.post_type.as_str())
        .bind(serde_json::to_value(&post.image_urls).unwrap_or_default())
        .bind(&post.video_url)
        .bind(&post.comment)
        .bind(post.account_id)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(json_opt(&post.schedule_config))
        .bind(post.published_at)
        .bind(&post.platform_post_id)
        .bind(&post.platform_comment_id)
        .bind(post.comment_status.as_str())
        .bind(post.comment_retry_count)
        .bind(&post.content_hash)
        .bind(json_opt(&post.publishing_progress))
        .bind(post.execution_lock.as_ref().map(|l| l.locked_by.clone()))
        .bind(post.execution_lock.as_ref().map(|l| l.locked_at))
        .bind(post.execution_lock.as_ref().map(|l| l.expires_at))
        .bind(&post.error)
        .bind(post.error_category.map(|c| c.to_string()))
        .bind(&post.suggested_action)
        .bind(post.version)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to insert post", e))?;

        tracing::debug!(post_id = %post.id, "Post created");
        Ok(())
    }

    /// Find a post by id
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Post>> {
        let row: Option<PostRow> =
            sqlx::query_as(&format!("SELECT {} FROM posts WHERE id = $1", POST_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::database_with_source("Failed to fetch post", e))?;

        Ok(row.map(Into::into))
    }

    /// Find a post by id, erroring when missing
    pub async fn get(&self, id: Uuid) -> Result<Post> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found("Post", id))
    }

    /// Conditional update by `(id, version)`.
    ///
    /// On success the returned post carries the incremented version. A
    /// version mismatch yields `Error::Conflict`; the caller decides whether
    /// to reload and retry. The execution-lock columns are not touched here.
    pub async fn update(&self, post: &Post) -> Result<Post> {
        let result = sqlx::query(
            r#"
            UPDATE posts SET
                content = $3, post_type = $4, image_urls = $5, video_url = $6,
                comment = $7, account_id = $8, status = $9, scheduled_at = $10,
                schedule_config = $11, published_at = $12, platform_post_id = $13,
                platform_comment_id = $14, comment_status = $15, comment_retry_count = $16,
                content_hash = $17, publishing_progress = $18, error = $19,
                error_category = $20, suggested_action = $21,
                version = version + 1, updated_at = $22
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(post.id)
        .bind(post.version)
        .bind(&post.content)
        .bind(post.post_type.as_str())
        .bind(serde_json::to_value(&post.image_urls).unwrap_or_default())
        .bind(&post.video_url)
        .bind(&post.comment)
        .bind(post.account_id)
        .bind(post.status.as_str())
        .bind(post.scheduled_at)
        .bind(json_opt(&post.schedule_config))
        .bind(post.published_at)
        .bind(&post.platform_post_id)
        .bind(&post.platform_comment_id)
        .bind(post.comment_status.as_str())
        .bind(post.comment_retry_count)
        .bind(&post.content_hash)
        .bind(json_opt(&post.publishing_progress))
        .bind(&post.error)
        .bind(post.error_category.map(|c| c.to_string()))
        .bind(&post.suggested_action)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to update post", e))?;

        if result.rows_affected() == 0 {
            return if self.find_by_id(post.id).await?.is_some() {
                Err(Error::conflict("Post", post.id, post.version))
            } else {
                Err(Error::not_found("Post", post.id))
            };
        }

        let mut updated = post.clone();
        updated.version += 1;
        Ok(updated)
    }

    /// Delete a post
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM posts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database_with_source("Failed to delete post", e))?;
        Ok(())
    }

    /// Scheduled posts due at or before `until`, earliest first
    pub async fn scheduled_due(&self, until: DateTime<Utc>) -> Result<Vec<Post>> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM posts \
             WHERE status = 'scheduled' AND scheduled_at <= $1 \
             ORDER BY scheduled_at ASC",
            POST_COLUMNS
        ))
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to query due posts", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Earliest `scheduled_at` among all SCHEDULED posts
    pub async fn min_scheduled_at(&self) -> Result<Option<DateTime<Utc>>> {
        let (min,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MIN(scheduled_at) FROM posts WHERE status = 'scheduled'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::database_with_source("Failed to query minimum scheduled_at", e)
                })?;
        Ok(min)
    }

    /// Another post with the same content hash that is PUBLISHING, or was
    /// PUBLISHED inside the lookback window. Drives the duplicate guard.
    pub async fn find_duplicate(
        &self,
        content_hash: &str,
        window: Duration,
        exclude_id: Uuid,
    ) -> Result<Option<Post>> {
        let row: Option<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM posts \
             WHERE content_hash = $1 AND id <> $2 \
               AND (status = 'publishing' \
                    OR (status = 'published' AND published_at > $3)) \
             LIMIT 1",
            POST_COLUMNS
        ))
        .bind(content_hash)
        .bind(exclude_id)
        .bind(Utc::now() - window)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to query duplicates", e))?;

        Ok(row.map(Into::into))
    }

    /// Atomically claim the execution lock for `worker_id`.
    ///
    /// Succeeds only when the lock is absent or expired. Returns false on
    /// contention; the caller treats that as a skip, not a failure.
    pub async fn claim_execution_lock(
        &self,
        id: Uuid,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE posts
            SET locked_by = $2, locked_at = $3, lock_expires_at = $4
            WHERE id = $1 AND (locked_by IS NULL OR lock_expires_at <= $3)
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .bind(now + ttl)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to claim execution lock", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Release the execution lock if still held by `worker_id`
    pub async fn release_execution_lock(&self, id: Uuid, worker_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE posts
            SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to release execution lock", e))?;
        Ok(())
    }

    /// Write the publishing progress without bumping the version.
    ///
    /// Only the worker holding the execution lock calls this; versioned
    /// writes from the same worker would otherwise conflict with their own
    /// progress updates.
    pub async fn update_progress(&self, id: Uuid, progress: &PublishingProgress) -> Result<()> {
        sqlx::query("UPDATE posts SET publishing_progress = $2 WHERE id = $1")
            .bind(id)
            .bind(serde_json::to_value(progress).unwrap_or_default())
            .execute(&self.pool)
            .await
            .map_err(|e| Error::database_with_source("Failed to update progress", e))?;
        Ok(())
    }

    /// Posts sitting in PUBLISHING since before `threshold`; candidates for
    /// the stuck-post sweep.
    pub async fn stuck_publishing(&self, threshold: DateTime<Utc>) -> Result<Vec<Post>> {
        let rows: Vec<PostRow> = sqlx::query_as(&format!(
            "SELECT {} FROM posts \
             WHERE status = 'publishing' AND updated_at < $1 \
             ORDER BY updated_at ASC",
            POST_COLUMNS
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to query stuck posts", e))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Repository for stored platform credentials (read-only to the engine)
#[derive(Clone)]
pub struct CredentialRepository {
    pool: PgPool,
}

impl CredentialRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT id, platform_user_id, access_token, expires_at \
             FROM credentials WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to fetch credential", e))?;

        Ok(row.map(Into::into))
    }

    /// The account used when a post has no explicit `account_id`
    pub async fn find_default(&self) -> Result<Option<Credential>> {
        let row: Option<CredentialRow> = sqlx::query_as(
            "SELECT id, platform_user_id, access_token, expires_at \
             FROM credentials WHERE is_default ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to fetch default credential", e))?;

        Ok(row.map(Into::into))
    }

    /// Resolve the credential for a post: explicit account or the default.
    pub async fn resolve(&self, account_id: Option<Uuid>) -> Result<Credential> {
        let found = match account_id {
            Some(id) => self.find_by_id(id).await?,
            None => self.find_default().await?,
        };
        found.ok_or_else(|| Error::CredentialNotFound {
            account_id: account_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "default".to_string()),
        })
    }
}

fn json_opt<T: serde::Serialize>(value: &Option<T>) -> Option<serde_json::Value> {
    value.as_ref().and_then(|v| serde_json::to_value(v).ok())
}

/// Database row for posts
#[derive(sqlx::FromRow)]
struct PostRow {
    id: Uuid,
    content: String,
    post_type: String,
    image_urls: serde_json::Value,
    video_url: Option<String>,
    comment: Option<String>,
    account_id: Option<Uuid>,
    status: String,
    scheduled_at: Option<DateTime<Utc>>,
    schedule_config: Option<serde_json::Value>,
    published_at: Option<DateTime<Utc>>,
    platform_post_id: Option<String>,
    platform_comment_id: Option<String>,
    comment_status: String,
    comment_retry_count: i32,
    content_hash: Option<String>,
    publishing_progress: Option<serde_json::Value>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    lock_expires_at: Option<DateTime<Utc>>,
    error: Option<String>,
    error_category: Option<String>,
    suggested_action: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        let execution_lock = match (row.locked_by, row.locked_at, row.lock_expires_at) {
            (Some(locked_by), Some(locked_at), Some(expires_at)) => Some(ExecutionLock {
                locked_by,
                locked_at,
                expires_at,
            }),
            _ => None,
        };

        Post {
            id: row.id,
            content: row.content,
            post_type: PostType::parse(&row.post_type).unwrap_or(PostType::Text),
            image_urls: serde_json::from_value(row.image_urls).unwrap_or_default(),
            video_url: row.video_url,
            comment: row.comment,
            account_id: row.account_id,
            status: PostStatus::parse(&row.status).unwrap_or(PostStatus::Draft),
            scheduled_at: row.scheduled_at,
            schedule_config: row
                .schedule_config
                .and_then(|v| serde_json::from_value::<ScheduleConfig>(v).ok()),
            published_at: row.published_at,
            platform_post_id: row.platform_post_id,
            platform_comment_id: row.platform_comment_id,
            comment_status: CommentStatus::parse(&row.comment_status)
                .unwrap_or(CommentStatus::None),
            comment_retry_count: row.comment_retry_count,
            content_hash: row.content_hash,
            publishing_progress: row
                .publishing_progress
                .and_then(|v| serde_json::from_value::<PublishingProgress>(v).ok()),
            execution_lock,
            error: row.error,
            error_category: row.error_category.and_then(|c| match c.as_str() {
                "FATAL" => Some(ErrorCategory::Fatal),
                "RETRYABLE" => Some(ErrorCategory::Retryable),
                "TRANSIENT" => Some(ErrorCategory::Transient),
                _ => None,
            }),
            suggested_action: row.suggested_action,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Database row for credentials
#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: Uuid,
    platform_user_id: String,
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl From<CredentialRow> for Credential {
    fn from(row: CredentialRow) -> Self {
        Credential {
            id: row.id,
            platform_user_id: row.platform_user_id,
            access_token: row.access_token,
            expires_at: row.expires_at,
        }
    }
}
