//! The publish job pipeline.
//!
//! One `publish` job flows through: pre-checks, duplicate guard, execution
//! lock, credential load, PUBLISHING transition, adapter call, terminal
//! write, lock release. Failures are classified and either roll the post
//! back, mark it failed, or leave it untouched for a queue retry.

use crate::classify::{self, disposition, FailureDisposition, PublishOrigin};
use crate::guard::PublishGuard;
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use threadline_core::config::{PublisherConfig, WorkerConfig};
use threadline_core::error::{Error, ErrorCategory, Result};
use threadline_database::models::{
    CommentStatus, Post, PostStatus, PostType, ProgressStatus, PublishingProgress,
};
use threadline_database::{CredentialRepository, PostRepository};
use threadline_platform::{
    AdapterRegistry, CommentOutcome, Credentials, Media, ProgressCallback, PublishRequest,
    THREADS_PLATFORM,
};
use threadline_queue::{comment_retry_job_id, Job, PublishJob, Queue};
use threadline_scheduler::{next_occurrence, EventScheduler};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Orchestrates publish jobs end to end
pub struct PublishPipeline {
    posts: PostRepository,
    credentials: CredentialRepository,
    queue: Arc<dyn Queue>,
    scheduler: Arc<EventScheduler>,
    adapters: Arc<AdapterRegistry>,
    guard: PublishGuard,
    config: PublisherConfig,
    worker: WorkerConfig,
    tz: Tz,
}

impl PublishPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        posts: PostRepository,
        credentials: CredentialRepository,
        queue: Arc<dyn Queue>,
        scheduler: Arc<EventScheduler>,
        adapters: Arc<AdapterRegistry>,
        config: PublisherConfig,
        worker: WorkerConfig,
        tz: Tz,
    ) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        let guard = PublishGuard::new(posts.clone(), config.clone(), worker_id);
        Self {
            posts,
            credentials,
            queue,
            scheduler,
            adapters,
            guard,
            config,
            worker,
            tz,
        }
    }

    /// Entry point for one `publish` job
    pub async fn process(&self, job: &Job) -> Result<()> {
        let payload: PublishJob = job.decode()?;
        if payload.comment_only_retry {
            self.process_comment_retry(&payload).await
        } else {
            self.process_publish(&payload, job).await
        }
    }

    async fn process_publish(&self, payload: &PublishJob, job: &Job) -> Result<()> {
        let Some(post) = self.posts.find_by_id(payload.post_id).await? else {
            warn!(post_id = %payload.post_id, "Post no longer exists, dropping job");
            return Ok(());
        };

        if self.guard.already_published(&post) {
            debug!(post_id = %post.id, "Already published, idempotent replay skipped");
            return Ok(());
        }
        if !post.can_publish() {
            debug!(post_id = %post.id, status = ?post.status, "Post not publishable, skipping");
            return Ok(());
        }

        if let Err(e) = post.validate() {
            return self
                .handle_failure(
                    post,
                    ErrorCategory::Retryable,
                    e.to_string(),
                    "Fix the post content and media, then retry".to_string(),
                    job,
                )
                .await;
        }

        // The hash is recomputed every attempt so edits between attempts
        // are caught.
        let content_hash = post.compute_content_hash();
        match self.guard.check_duplicate(&post, &content_hash).await {
            Ok(()) => {}
            Err(e @ Error::DuplicateContent { .. }) => {
                let message = e.to_string();
                return self
                    .handle_failure(
                        post,
                        ErrorCategory::Fatal,
                        message,
                        "Edit the content; an identical post was published recently".to_string(),
                        job,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        }

        if !self.guard.acquire_lock(post.id).await? {
            info!(
                post_id = %post.id,
                holder = ?self.guard.lock_holder(&post),
                "Post locked by another worker, skipping"
            );
            return Ok(());
        }

        let post_id = post.id;
        let outcome = self.run_locked(post, payload, content_hash, job).await;
        self.guard.release_lock(post_id).await;
        outcome
    }

    /// Credential load, PUBLISHING transition, and the adapter call, all
    /// under the execution lock
    async fn run_locked(
        &self,
        mut post: Post,
        payload: &PublishJob,
        content_hash: String,
        job: &Job,
    ) -> Result<()> {
        let now = Utc::now();

        let account_id = payload.account_id.or(post.account_id);
        let credential = match self.credentials.resolve(account_id).await {
            Ok(credential) => credential,
            Err(e @ Error::CredentialNotFound { .. }) => {
                return self
                    .handle_failure(
                        post,
                        ErrorCategory::Fatal,
                        e.to_string(),
                        "Connect a Threads account before publishing".to_string(),
                        job,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        if credential.is_expired(now) {
            return self
                .handle_failure(
                    post,
                    ErrorCategory::Fatal,
                    format!("access token for account {} has expired", credential.id),
                    "Reconnect the Threads account to refresh its access token".to_string(),
                    job,
                )
                .await;
        }
        if credential.expires_within(now, ChronoDuration::hours(1)) {
            // Refresh is owned by the credential service; flag it here.
            warn!(account_id = %credential.id, "Access token due for refresh within the hour");
        }

        post.status = PostStatus::Publishing;
        let mut progress = post
            .publishing_progress
            .take()
            .filter(|p| p.status == ProgressStatus::Running)
            .unwrap_or_else(|| PublishingProgress::started(now));
        progress.advance("Starting", now);
        post.publishing_progress = Some(progress.clone());
        post.content_hash = Some(content_hash);

        // A conflict here is transient by design: nothing else is written
        // and the queue retries against fresh data.
        let post = self.posts.update(&post).await?;

        let adapter = self
            .adapters
            .get(THREADS_PLATFORM)
            .ok_or_else(|| Error::internal("no adapter registered for threads"))?;

        let request = PublishRequest {
            credentials: Credentials {
                user_id: credential.platform_user_id.clone(),
                access_token: credential.access_token.clone(),
            },
            content: post.content.clone(),
            media: media_for(&post),
            comment: post.comment.clone(),
            skip_comment: false,
            deadline: Some(Instant::now() + self.worker.job_timeout()),
        };

        let callback = self.progress_callback(post.id, progress);
        match adapter.publish_post(request, callback).await {
            Ok(result) => self.handle_success(post, result).await,
            Err(err) => {
                let category = err.category();
                let action = classify::suggested_action(&err);
                self.handle_failure(post, category, err.to_string(), action, job)
                    .await
            }
        }
    }

    /// Success arm: terminal write, comment bookkeeping, recurrence
    async fn handle_success(
        &self,
        mut post: Post,
        result: threadline_platform::PublishResult,
    ) -> Result<()> {
        let now = Utc::now();
        post.status = PostStatus::Published;
        post.platform_post_id = Some(result.platform_post_id.clone());
        post.published_at = Some(now);
        post.error = None;
        post.error_category = None;
        post.suggested_action = None;
        if let Some(progress) = post.publishing_progress.as_mut() {
            progress.advance("Done", now);
            progress.status = ProgressStatus::Completed;
        }

        let mut comment_retry_delay = None;
        match result.comment {
            CommentOutcome::Skipped => {
                post.comment_status = CommentStatus::None;
            }
            CommentOutcome::Posted { comment_id } => {
                post.comment_status = CommentStatus::Posted;
                post.platform_comment_id = Some(comment_id);
            }
            CommentOutcome::Failed { error } => {
                warn!(post_id = %post.id, error = %error, "Comment failed after publish");
                post.comment_status = CommentStatus::Failed;
                if error.is_server_error()
                    && post.comment_retry_count < self.config.comment_max_retries as i32
                {
                    comment_retry_delay = Some(
                        self.config.comment_retry_base_secs
                            * (post.comment_retry_count as u64 + 1),
                    );
                }
            }
        }

        let mut next_fire = None;
        if post.is_recurring() {
            if let Some(schedule) = post.schedule_config.clone() {
                match next_occurrence(&schedule, now, self.tz) {
                    Some(next) => {
                        post.status = PostStatus::Scheduled;
                        post.scheduled_at = Some(next);
                        post.platform_post_id = None;
                        if let Some(config) = post.schedule_config.as_mut() {
                            config.scheduled_at = next;
                        }
                        next_fire = Some(next);
                    }
                    None => {
                        // Schedule exhausted; the post terminates published.
                        post.scheduled_at = None;
                    }
                }
            }
        }

        let post = self.save_with_retry(post).await?;

        if let Some(delay_secs) = comment_retry_delay {
            self.enqueue_comment_retry(&post, delay_secs).await?;
        }
        if let Some(next) = next_fire {
            if let Err(e) = self.scheduler.on_post_scheduled(post.id, next).await {
                // The periodic validator will converge the armed tick.
                warn!(post_id = %post.id, error = %e, "Re-arm after recurrence failed");
            }
        }

        info!(
            post_id = %post.id,
            platform_post_id = %result.platform_post_id,
            "Post published"
        );
        Ok(())
    }

    /// Classify a failed attempt and apply the rollback policy
    async fn handle_failure(
        &self,
        mut post: Post,
        category: ErrorCategory,
        message: String,
        action: String,
        job: &Job,
    ) -> Result<()> {
        let last_attempt = job.attempts >= job.max_attempts;
        let origin = PublishOrigin::of(&post);
        let target = disposition(category, origin, last_attempt);

        if target == FailureDisposition::LeaveUntouched {
            debug!(post_id = %post.id, error = %message, "Transient failure, no post write");
            return Err(Error::platform(message, ErrorCategory::Transient));
        }

        let now = Utc::now();
        post.error = Some(message.clone());
        post.error_category = Some(category);
        post.suggested_action = Some(action);
        if let Some(progress) = post.publishing_progress.as_mut() {
            progress.status = ProgressStatus::Failed;
            progress.error = Some(message.clone());
            progress.last_updated_at = now;
        }

        let mut next_fire = None;
        match target {
            FailureDisposition::MarkFailed => {
                post.status = PostStatus::Failed;
            }
            FailureDisposition::RollbackScheduled => {
                post.status = PostStatus::Scheduled;
            }
            FailureDisposition::RollbackDraft => {
                post.status = PostStatus::Draft;
                post.scheduled_at = None;
            }
            FailureDisposition::ParkScheduled => {
                // Attempts for this occurrence are spent; aim the post at
                // its next occurrence instead of retrying a stale one.
                post.status = PostStatus::Scheduled;
                if let Some(schedule) = post.schedule_config.clone() {
                    if let Some(next) = next_occurrence(&schedule, now, self.tz) {
                        post.scheduled_at = Some(next);
                        if let Some(config) = post.schedule_config.as_mut() {
                            config.scheduled_at = next;
                        }
                        next_fire = Some(next);
                    }
                }
            }
            FailureDisposition::LeaveUntouched => unreachable!(),
        }

        self.save_with_retry(post.clone()).await?;

        if let Some(next) = next_fire {
            if let Err(e) = self.scheduler.on_post_scheduled(post.id, next).await {
                warn!(post_id = %post.id, error = %e, "Re-arm after rollback failed");
            }
        }

        match target {
            FailureDisposition::RollbackScheduled | FailureDisposition::RollbackDraft => {
                // Surface a retryable error so the queue re-delivers.
                Err(Error::platform(message, ErrorCategory::Retryable))
            }
            _ => {
                warn!(post_id = %post.id, category = %category, error = %message,
                      "Publish failed terminally");
                Ok(())
            }
        }
    }

    /// Comment-only retry for an already-published post. Never touches the
    /// main-post status.
    async fn process_comment_retry(&self, payload: &PublishJob) -> Result<()> {
        let Some(mut post) = self.posts.find_by_id(payload.post_id).await? else {
            return Ok(());
        };
        let Some(parent_id) = post.platform_post_id.clone() else {
            warn!(post_id = %post.id, "Comment retry on unpublished post, dropping");
            return Ok(());
        };
        if post.status != PostStatus::Published {
            warn!(post_id = %post.id, status = ?post.status, "Comment retry on non-published post");
            return Ok(());
        }
        let Some(text) = post.comment.clone().filter(|t| !t.trim().is_empty()) else {
            return Ok(());
        };
        if post.comment_retry_count >= self.config.comment_max_retries as i32 {
            debug!(post_id = %post.id, "Comment retry budget spent");
            return Ok(());
        }

        post.comment_status = CommentStatus::Posting;
        post.comment_retry_count += 1;
        let mut post = self.posts.update(&post).await?;

        let credential = match self
            .credentials
            .resolve(payload.account_id.or(post.account_id))
            .await
        {
            Ok(credential) => credential,
            Err(e) => {
                post.comment_status = CommentStatus::Failed;
                post.error = Some(format!("Comment retry failed: {}", e));
                self.save_with_retry(post).await?;
                return Ok(());
            }
        };

        let adapter = self
            .adapters
            .get(THREADS_PLATFORM)
            .ok_or_else(|| Error::internal("no adapter registered for threads"))?;
        let credentials = Credentials {
            user_id: credential.platform_user_id,
            access_token: credential.access_token,
        };
        let deadline = Some(Instant::now() + self.worker.job_timeout());

        match adapter
            .publish_comment(&credentials, &parent_id, &text, deadline)
            .await
        {
            Ok(comment_id) => {
                post.comment_status = CommentStatus::Posted;
                post.platform_comment_id = Some(comment_id.clone());
                self.save_with_retry(post).await?;
                info!(post_id = %payload.post_id, comment_id = %comment_id, "Comment posted on retry");
                Ok(())
            }
            Err(err) => {
                post.comment_status = CommentStatus::Failed;
                post.error = Some(format!("Comment failed: {}", err));
                post.suggested_action = Some(classify::suggested_action(&err));
                let retry = err.is_server_error()
                    && post.comment_retry_count < self.config.comment_max_retries as i32;
                let delay_secs =
                    self.config.comment_retry_base_secs * (post.comment_retry_count as u64 + 1);

                let post = self.save_with_retry(post).await?;
                if retry {
                    self.enqueue_comment_retry(&post, delay_secs).await?;
                }
                Ok(())
            }
        }
    }

    async fn enqueue_comment_retry(&self, post: &Post, delay_secs: u64) -> Result<()> {
        let payload = PublishJob {
            post_id: post.id,
            account_id: post.account_id,
            comment_only_retry: true,
        };
        let job = Job::new(comment_retry_job_id(post.id, Utc::now()), &payload)?
            .delay_ms(delay_secs * 1_000);
        self.queue.enqueue(job).await?;
        debug!(post_id = %post.id, delay_secs, "Comment retry enqueued");
        Ok(())
    }

    /// Save tolerating concurrent writers: on a version conflict, reload
    /// and re-apply the pipeline's outcome fields, up to three attempts.
    async fn save_with_retry(&self, mut post: Post) -> Result<Post> {
        for attempt in 1..=3u32 {
            match self.posts.update(&post).await {
                Ok(saved) => return Ok(saved),
                Err(Error::Conflict { .. }) if attempt < 3 => {
                    debug!(post_id = %post.id, attempt, "Concurrent writer, merging and retrying");
                    let fresh = self.posts.get(post.id).await?;
                    post = merge_outcome(fresh, post);
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("save loop returns on every path")
    }

    fn progress_callback(&self, post_id: Uuid, base: PublishingProgress) -> ProgressCallback {
        let posts = self.posts.clone();
        let state = Arc::new(std::sync::Mutex::new(base));
        Arc::new(move |step| {
            let snapshot = {
                let mut progress = state.lock().expect("progress mutex poisoned");
                progress.advance(step.to_string(), Utc::now());
                progress.clone()
            };
            let posts = posts.clone();
            // The adapter must never block on its callback.
            tokio::spawn(async move {
                if let Err(e) = posts.update_progress(post_id, &snapshot).await {
                    debug!(post_id = %post_id, error = %e, "Progress write failed");
                }
            });
        })
    }
}

/// Map the stored post shape onto an adapter media request
fn media_for(post: &Post) -> Media {
    match post.post_type {
        PostType::Text => Media::Text,
        PostType::Image => post
            .image_urls
            .first()
            .map(|url| Media::Image { url: url.clone() })
            .unwrap_or(Media::Text),
        PostType::Carousel => Media::Carousel {
            urls: post.image_urls.clone(),
        },
        PostType::Video => post
            .video_url
            .clone()
            .map(|url| Media::Video { url })
            .unwrap_or(Media::Text),
    }
}

/// Re-apply this pipeline's outcome onto a freshly loaded row, keeping any
/// concurrent content edits.
fn merge_outcome(fresh: Post, ours: Post) -> Post {
    Post {
        status: ours.status,
        scheduled_at: ours.scheduled_at,
        schedule_config: ours.schedule_config,
        published_at: ours.published_at,
        platform_post_id: ours.platform_post_id,
        platform_comment_id: ours.platform_comment_id,
        comment_status: ours.comment_status,
        comment_retry_count: ours.comment_retry_count,
        content_hash: ours.content_hash,
        publishing_progress: ours.publishing_progress,
        error: ours.error,
        error_category: ours.error_category,
        suggested_action: ours.suggested_action,
        ..fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_for_shapes() {
        let text = Post::new("t", PostType::Text);
        assert_eq!(media_for(&text), Media::Text);

        let image =
            Post::new("i", PostType::Image).with_images(vec!["https://cdn.example/a.jpg".into()]);
        assert_eq!(
            media_for(&image),
            Media::Image {
                url: "https://cdn.example/a.jpg".into()
            }
        );

        let video = Post::new("v", PostType::Video).with_video("https://cdn.example/v.mp4");
        assert_eq!(
            media_for(&video),
            Media::Video {
                url: "https://cdn.example/v.mp4".into()
            }
        );
    }

    #[test]
    fn test_merge_outcome_keeps_fresh_content_and_our_result() {
        let mut fresh = Post::new("edited content", PostType::Text);
        fresh.version = 7;

        let mut ours = fresh.clone();
        ours.content = "stale content".to_string();
        ours.version = 5;
        ours.status = PostStatus::Published;
        ours.platform_post_id = Some("p-1".to_string());
        ours.published_at = Some(Utc::now());

        let merged = merge_outcome(fresh, ours);
        assert_eq!(merged.content, "edited content");
        assert_eq!(merged.version, 7);
        assert_eq!(merged.status, PostStatus::Published);
        assert_eq!(merged.platform_post_id.as_deref(), Some("p-1"));
    }
}
