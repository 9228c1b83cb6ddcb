//! Idempotency guards: execution lock, duplicate content, already-published.

use chrono::Utc;
use threadline_core::config::PublisherConfig;
use threadline_core::error::{Error, Result};
use threadline_database::{Post, PostRepository};
use tracing::debug;

/// Store-side guards evaluated before any platform call
pub struct PublishGuard {
    posts: PostRepository,
    config: PublisherConfig,
    worker_id: String,
}

impl PublishGuard {
    pub fn new(posts: PostRepository, config: PublisherConfig, worker_id: String) -> Self {
        Self {
            posts,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Idempotent-replay guard: a post already published with a platform id
    /// is silently skipped.
    pub fn already_published(&self, post: &Post) -> bool {
        post.status == threadline_database::PostStatus::Published
            && post.platform_post_id.is_some()
    }

    /// Abort when another post with the same content hash is publishing, or
    /// was published within the lookback window.
    pub async fn check_duplicate(&self, post: &Post, content_hash: &str) -> Result<()> {
        let window = self.config.duplication_window();
        if let Some(existing) = self
            .posts
            .find_duplicate(content_hash, window, post.id)
            .await?
        {
            let published_at = existing
                .published_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "now (still publishing)".to_string());
            return Err(Error::DuplicateContent {
                existing_id: existing.id.to_string(),
                published_at,
            });
        }
        Ok(())
    }

    /// Claim the execution lock; false means another worker owns the post.
    pub async fn acquire_lock(&self, post_id: uuid::Uuid) -> Result<bool> {
        let ttl = self.config.execution_lock_timeout();
        let claimed = self
            .posts
            .claim_execution_lock(post_id, &self.worker_id, ttl)
            .await?;
        if !claimed {
            debug!(post_id = %post_id, worker_id = %self.worker_id, "Execution lock contended");
        }
        Ok(claimed)
    }

    /// Release the lock; failures are logged, not propagated, because the
    /// TTL reclaims an orphaned lock anyway.
    pub async fn release_lock(&self, post_id: uuid::Uuid) {
        if let Err(e) = self
            .posts
            .release_execution_lock(post_id, &self.worker_id)
            .await
        {
            debug!(post_id = %post_id, error = %e, "Execution lock release failed");
        }
    }

    /// Stale-lock diagnostics for skip decisions
    pub fn lock_holder(&self, post: &Post) -> Option<String> {
        let now = Utc::now();
        post.execution_lock
            .as_ref()
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.locked_by.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_database::{ExecutionLock, PostStatus, PostType};

    fn post() -> Post {
        Post::new("hello", PostType::Text)
    }

    #[tokio::test]
    async fn test_already_published_requires_platform_id() {
        let posts = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://localhost/x");
        let guard = PublishGuard::new(
            PostRepository::new(posts.unwrap()),
            PublisherConfig::default(),
            "w1".to_string(),
        );

        let mut p = post();
        assert!(!guard.already_published(&p));

        p.status = PostStatus::Published;
        assert!(!guard.already_published(&p));

        p.platform_post_id = Some("123".to_string());
        assert!(guard.already_published(&p));
    }

    #[tokio::test]
    async fn test_lock_holder_ignores_expired_locks() {
        let posts = sqlx::postgres::PgPoolOptions::new().connect_lazy("postgres://localhost/x");
        let guard = PublishGuard::new(
            PostRepository::new(posts.unwrap()),
            PublisherConfig::default(),
            "w1".to_string(),
        );

        let now = Utc::now();
        let mut p = post();
        p.execution_lock = Some(ExecutionLock {
            locked_by: "w2".to_string(),
            locked_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        });
        assert_eq!(guard.lock_holder(&p), Some("w2".to_string()));

        p.execution_lock = Some(ExecutionLock {
            locked_by: "w2".to_string(),
            locked_at: now - chrono::Duration::minutes(10),
            expires_at: now - chrono::Duration::minutes(5),
        });
        assert_eq!(guard.lock_holder(&p), None);
    }
}
