//! Crash recovery for posts stranded in PUBLISHING.
//!
//! A stalled job or a stuck post means a worker died mid-pipeline. If the
//! platform post id was saved, the publish itself succeeded and only the
//! terminal write was lost; otherwise the attempt is written off.

use chrono::{Duration, Utc};
use threadline_core::config::PublisherConfig;
use threadline_core::error::{Error, ErrorCategory, Result};
use threadline_database::models::{Post, PostStatus, ProgressStatus};
use threadline_database::PostRepository;
use tracing::{info, warn};
use uuid::Uuid;

/// What recovery did to a post
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    MarkedPublished,
    MarkedFailed,
    Untouched,
}

/// Applies the stalled-worker repair rule to individual posts and sweeps
pub struct RecoveryService {
    posts: PostRepository,
    config: PublisherConfig,
}

impl RecoveryService {
    pub fn new(posts: PostRepository, config: PublisherConfig) -> Self {
        Self { posts, config }
    }

    /// Repair one post referenced by a stalled job or an admin command
    pub async fn recover_post(&self, post_id: Uuid) -> Result<RecoveryOutcome> {
        let Some(post) = self.posts.find_by_id(post_id).await? else {
            return Ok(RecoveryOutcome::Untouched);
        };
        self.apply(post).await
    }

    /// Sweep every post stuck in PUBLISHING beyond the threshold
    pub async fn sweep_stuck(&self) -> Result<u32> {
        let threshold = Utc::now() - Duration::minutes(self.config.stuck_threshold_mins);
        let stuck = self.posts.stuck_publishing(threshold).await?;
        let mut repaired = 0;

        for post in stuck {
            if self.apply(post).await? != RecoveryOutcome::Untouched {
                repaired += 1;
            }
        }

        if repaired > 0 {
            info!(repaired, "Stuck-post sweep repaired posts");
        }
        Ok(repaired)
    }

    async fn apply(&self, post: Post) -> Result<RecoveryOutcome> {
        if post.status != PostStatus::Publishing {
            return Ok(RecoveryOutcome::Untouched);
        }

        let (mut post, outcome) = repair(post);
        warn!(post_id = %post.id, outcome = ?outcome, "Recovering stranded post");

        for attempt in 1..=3u32 {
            match self.posts.update(&post).await {
                Ok(_) => return Ok(outcome),
                Err(Error::Conflict { .. }) if attempt < 3 => {
                    let Some(fresh) = self.posts.find_by_id(post.id).await? else {
                        return Ok(RecoveryOutcome::Untouched);
                    };
                    if fresh.status != PostStatus::Publishing {
                        // Someone else already repaired or finished it.
                        return Ok(RecoveryOutcome::Untouched);
                    }
                    let (repaired, _) = repair(fresh);
                    post = repaired;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("repair loop returns on every path")
    }
}

/// The repair rule: a saved platform id means the publish happened. The
/// dead worker's execution lock is left to expire on its own TTL.
fn repair(mut post: Post) -> (Post, RecoveryOutcome) {
    let now = Utc::now();

    if post.platform_post_id.is_some() {
        post.status = PostStatus::Published;
        post.published_at = post.published_at.or(Some(now));
        post.error = None;
        post.error_category = None;
        post.suggested_action = None;
        if let Some(progress) = post.publishing_progress.as_mut() {
            progress.advance("Done", now);
            progress.status = ProgressStatus::Completed;
        }
        (post, RecoveryOutcome::MarkedPublished)
    } else {
        post.status = PostStatus::Failed;
        post.error = Some("worker crashed during processing".to_string());
        post.error_category = Some(ErrorCategory::Fatal);
        post.suggested_action = Some("Retry the post manually once the cause is clear".to_string());
        if let Some(progress) = post.publishing_progress.as_mut() {
            progress.status = ProgressStatus::Failed;
            progress.error = post.error.clone();
            progress.last_updated_at = now;
        }
        (post, RecoveryOutcome::MarkedFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_database::PostType;

    #[test]
    fn test_repair_assumes_success_with_platform_id() {
        let mut post = Post::new("x", PostType::Text);
        post.status = PostStatus::Publishing;
        post.platform_post_id = Some("p-1".to_string());

        let (repaired, outcome) = repair(post);
        assert_eq!(outcome, RecoveryOutcome::MarkedPublished);
        assert_eq!(repaired.status, PostStatus::Published);
        assert!(repaired.published_at.is_some());
        assert!(repaired.error.is_none());
    }

    #[test]
    fn test_repair_fails_without_platform_id() {
        let mut post = Post::new("x", PostType::Text);
        post.status = PostStatus::Publishing;

        let (repaired, outcome) = repair(post);
        assert_eq!(outcome, RecoveryOutcome::MarkedFailed);
        assert_eq!(repaired.status, PostStatus::Failed);
        assert_eq!(
            repaired.error.as_deref(),
            Some("worker crashed during processing")
        );
        assert_eq!(repaired.error_category, Some(ErrorCategory::Fatal));
    }
}
