//! Public commands exposed to the engine's collaborators (API handlers,
//! importers, admin tooling).

use crate::recovery::{RecoveryOutcome, RecoveryService};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use threadline_core::error::{Error, Result};
use threadline_database::models::{Post, PostStatus, ScheduleConfig};
use threadline_database::PostRepository;
use threadline_queue::{publish_job_id, Job, PublishJob, Queue};
use threadline_scheduler::EventScheduler;
use tracing::{info, warn};
use uuid::Uuid;

/// Commands over the post lifecycle
pub struct PostCommands {
    posts: PostRepository,
    queue: Arc<dyn Queue>,
    scheduler: Arc<EventScheduler>,
    recovery: Arc<RecoveryService>,
}

impl PostCommands {
    pub fn new(
        posts: PostRepository,
        queue: Arc<dyn Queue>,
        scheduler: Arc<EventScheduler>,
        recovery: Arc<RecoveryService>,
    ) -> Self {
        Self {
            posts,
            queue,
            scheduler,
            recovery,
        }
    }

    /// Schedule a draft post. Validates, persists, and notifies the
    /// scheduler so the armed tick covers the new instant.
    pub async fn schedule_post(
        &self,
        post_id: Uuid,
        schedule: ScheduleConfig,
        account_id: Option<Uuid>,
    ) -> Result<Post> {
        ensure_future(schedule.scheduled_at, Utc::now())?;

        let mut post = self.posts.get(post_id).await?;
        if post.status != PostStatus::Draft {
            return Err(Error::invalid_input(
                "status",
                format!("only drafts can be scheduled, post is {:?}", post.status),
            ));
        }
        post.validate()?;

        let scheduled_at = schedule.scheduled_at;
        post.status = PostStatus::Scheduled;
        post.scheduled_at = Some(scheduled_at);
        post.schedule_config = Some(schedule);
        if account_id.is_some() {
            post.account_id = account_id;
        }
        post.error = None;
        post.error_category = None;
        post.suggested_action = None;

        let post = self.posts.update(&post).await?;
        if let Err(e) = self.scheduler.on_post_scheduled(post.id, scheduled_at).await {
            // The periodic validator converges the armed tick.
            warn!(post_id = %post.id, error = %e, "Tick re-arm failed after scheduling");
        }

        info!(post_id = %post.id, scheduled_at = %scheduled_at, "Post scheduled");
        Ok(post)
    }

    /// Revert scheduled posts to drafts; returns how many were reverted
    pub async fn cancel_scheduled(&self, post_ids: &[Uuid]) -> Result<u32> {
        let mut reverted = 0;

        for &post_id in post_ids {
            let Some(mut post) = self.posts.find_by_id(post_id).await? else {
                continue;
            };
            if post.status != PostStatus::Scheduled {
                continue;
            }

            post.status = PostStatus::Draft;
            post.scheduled_at = None;
            post.schedule_config = None;
            self.posts.update(&post).await?;
            reverted += 1;

            if let Err(e) = self.scheduler.on_post_cancelled(post_id).await {
                warn!(post_id = %post_id, error = %e, "Tick re-arm failed after cancel");
            }
        }

        info!(count = reverted, "Scheduled posts cancelled");
        Ok(reverted)
    }

    /// FAILED → DRAFT so the user can edit and reschedule
    pub async fn retry_failed(&self, post_id: Uuid) -> Result<Post> {
        let mut post = self.posts.get(post_id).await?;
        if post.status != PostStatus::Failed {
            return Err(Error::invalid_input(
                "status",
                format!("only failed posts can be retried, post is {:?}", post.status),
            ));
        }

        post.status = PostStatus::Draft;
        post.error = None;
        post.error_category = None;
        post.suggested_action = None;
        post.publishing_progress = None;
        self.posts.update(&post).await
    }

    /// Enqueue a post for immediate publishing
    pub async fn publish_now(&self, post_id: Uuid, account_id: Option<Uuid>) -> Result<String> {
        let mut post = self.posts.get(post_id).await?;
        if !matches!(post.status, PostStatus::Draft | PostStatus::Scheduled) {
            return Err(Error::invalid_input(
                "status",
                format!("post is {:?} and cannot be published now", post.status),
            ));
        }
        post.validate()?;

        if account_id.is_some() && post.account_id != account_id {
            post.account_id = account_id;
            post = self.posts.update(&post).await?;
        }

        let job_id = publish_job_id(post.id, Utc::now().timestamp_millis());
        let payload = PublishJob {
            post_id: post.id,
            account_id: post.account_id,
            comment_only_retry: false,
        };
        self.queue.enqueue(Job::new(&job_id, &payload)?).await?;

        info!(post_id = %post.id, job_id = %job_id, "Post enqueued for immediate publish");
        Ok(job_id)
    }

    /// Admin repair for a post stuck in PUBLISHING
    pub async fn fix_stuck(&self, post_id: Uuid) -> Result<RecoveryOutcome> {
        self.recovery.recover_post(post_id).await
    }

    /// Delete a post. Publishing posts cannot be deleted; deleting a
    /// scheduled post re-arms the tick.
    pub async fn delete_post(&self, post_id: Uuid) -> Result<()> {
        let post = self.posts.get(post_id).await?;
        if post.status == PostStatus::Publishing {
            return Err(Error::invalid_input(
                "status",
                "posts cannot be deleted while publishing",
            ));
        }

        let was_scheduled = post.status == PostStatus::Scheduled;
        self.posts.delete(post_id).await?;

        if was_scheduled {
            if let Err(e) = self.scheduler.on_post_cancelled(post_id).await {
                warn!(post_id = %post_id, error = %e, "Tick re-arm failed after delete");
            }
        }
        Ok(())
    }
}

/// Scheduling a post in the past is a caller error, surfaced synchronously
fn ensure_future(at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if at <= now {
        return Err(Error::invalid_input(
            "scheduled_at",
            "scheduled time must be in the future",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_ensure_future_rejects_past_and_now() {
        let now = Utc::now();
        assert!(ensure_future(now, now).is_err());
        assert!(ensure_future(now - Duration::seconds(1), now).is_err());
        assert!(ensure_future(now + Duration::seconds(1), now).is_ok());
    }
}
