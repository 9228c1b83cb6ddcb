//! Event-driven tick scheduler.
//!
//! At any moment at most one tick job is armed, scheduled for the earliest
//! `scheduled_at` among SCHEDULED posts. Scheduling events adjust the armed
//! tick instead of polling. When a tick fires, every post due within the
//! batch window is swept onto the publish queue.

use crate::state::SchedulerState;
use chrono::{DateTime, Utc};
use std::cmp;
use std::sync::Arc;
use std::time::Duration;
use threadline_core::config::SchedulerConfig;
use threadline_core::error::{Error, Result};
use threadline_database::models::{PostStatus, PublishingProgress};
use threadline_database::PostRepository;
use threadline_queue::{
    publish_job_id, tick_job_id, EnqueueOutcome, Job, JobState, PublishJob, Queue, RemoveOutcome,
    SchedulerTickJob, SCHEDULER_TICK_QUEUE,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the armed tick should converge to
enum RearmTarget {
    /// Arm no later than this instant (cheap path for new schedules)
    AtMost(DateTime<Utc>),
    /// Recompute the earliest SCHEDULED instant from the store
    Recompute,
}

/// The event-driven scheduler
pub struct EventScheduler {
    state: SchedulerState,
    queue: Arc<dyn Queue>,
    posts: PostRepository,
    config: SchedulerConfig,
}

impl EventScheduler {
    pub fn new(
        state: SchedulerState,
        queue: Arc<dyn Queue>,
        posts: PostRepository,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state,
            queue,
            posts,
            config,
        }
    }

    /// Called after a post enters SCHEDULED
    pub async fn on_post_scheduled(
        &self,
        post_id: Uuid,
        scheduled_at: DateTime<Utc>,
    ) -> Result<()> {
        debug!(post_id = %post_id, scheduled_at = %scheduled_at, "Post scheduled");
        self.rearm(RearmTarget::AtMost(scheduled_at)).await
    }

    /// Called when a SCHEDULED post is deleted or reverted
    pub async fn on_post_cancelled(&self, post_id: Uuid) -> Result<()> {
        debug!(post_id = %post_id, "Post cancelled");
        self.rearm(RearmTarget::Recompute).await
    }

    /// Admin escape hatch: fire a tick as soon as possible
    pub async fn schedule_immediate_check(&self) -> Result<()> {
        self.rearm(RearmTarget::AtMost(Utc::now())).await
    }

    /// Startup reconciliation: keep consistent state, rebuild anything else
    pub async fn initialize(&self) -> Result<()> {
        if self.is_consistent().await? {
            info!("Scheduler state is consistent");
            return Ok(());
        }
        warn!("Scheduler state is stale, re-arming from the store");
        self.state.clear().await?;
        self.rearm(RearmTarget::Recompute).await
    }

    /// One pass of the periodic consistency validator
    pub async fn validate(&self) -> Result<()> {
        if self.is_consistent().await? {
            return Ok(());
        }
        warn!("Scheduler validator found inconsistent state, re-arming");
        self.rearm(RearmTarget::Recompute).await
    }

    /// Process a fired tick: sweep every post due within the batch window
    /// onto the publish queue, then re-arm for the new minimum.
    pub async fn process_due_tick(&self) -> Result<u32> {
        let now = Utc::now();
        let due = self.posts.scheduled_due(now + self.config.batch_window()).await?;
        let enqueued = self.enqueue_batch(&due, now).await?;

        if enqueued > 0 {
            info!(count = enqueued, "Tick dispatched due posts");
        }
        self.rearm(RearmTarget::Recompute).await?;
        Ok(enqueued)
    }

    /// Legacy fallback: one polling sweep of posts already due. No tick is
    /// armed; the caller loops on an interval.
    pub async fn poll_once(&self) -> Result<u32> {
        let now = Utc::now();
        let due = self.posts.scheduled_due(now).await?;
        self.enqueue_batch(&due, now).await
    }

    async fn enqueue_batch(
        &self,
        due: &[threadline_database::Post],
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let now_ms = now.timestamp_millis();
        let mut enqueued = 0;

        for (seq, post) in due.iter().enumerate() {
            // seq keeps ids unique when several posts share one sweep instant
            let job_id = publish_job_id(post.id, now_ms + seq as i64);
            let payload = PublishJob {
                post_id: post.id,
                account_id: post.account_id,
                comment_only_retry: false,
            };
            let job = Job::new(&job_id, &payload)?;

            match self.queue.enqueue(job).await? {
                EnqueueOutcome::Enqueued => {
                    self.mark_publishing(post, now).await;
                    enqueued += 1;
                }
                EnqueueOutcome::Duplicate => {
                    debug!(post_id = %post.id, "Publish job already queued, skipped");
                }
            }
        }
        Ok(enqueued)
    }

    async fn mark_publishing(&self, post: &threadline_database::Post, now: DateTime<Utc>) {
        let mut claimed = post.clone();
        claimed.status = PostStatus::Publishing;
        claimed.publishing_progress = Some(PublishingProgress::started(now));

        match self.posts.update(&claimed).await {
            Ok(_) => {}
            Err(Error::Conflict { .. }) => {
                // Another writer moved the post; the worker's own pre-check
                // will sort it out.
                debug!(post_id = %post.id, "Post changed while dispatching");
            }
            Err(e) => warn!(post_id = %post.id, error = %e, "Failed to mark post publishing"),
        }
    }

    async fn is_consistent(&self) -> Result<bool> {
        let next = self.state.next_execution_at().await?;
        let job_id = self.state.active_job_id().await?;

        match (next, job_id) {
            (Some(_), Some(job_id)) => Ok(matches!(
                self.queue.job_state(SCHEDULER_TICK_QUEUE, &job_id).await?,
                Some(JobState::Delayed) | Some(JobState::Waiting) | Some(JobState::Active)
            )),
            (None, None) => {
                // Empty state is only consistent when nothing is scheduled.
                Ok(self.posts.min_scheduled_at().await?.is_none())
            }
            _ => Ok(false),
        }
    }

    /// Converge the armed tick onto `target` under the reconciliation lock.
    async fn rearm(&self, target: RearmTarget) -> Result<()> {
        let token = self
            .state
            .lock(self.config.lock_ttl(), self.config.lock_wait())
            .await?;
        let outcome = self.rearm_locked(target).await;
        if let Err(e) = &outcome {
            debug!(error = %e, "Rearm failed under lock");
        }
        self.state.unlock(token).await.ok();
        outcome
    }

    async fn rearm_locked(&self, target: RearmTarget) -> Result<()> {
        let current = self.state.next_execution_at().await?;

        let new_target = match target {
            RearmTarget::AtMost(candidate) => Some(merge_target(current, candidate)),
            RearmTarget::Recompute => self.posts.min_scheduled_at().await?,
        };

        if new_target == current {
            return Ok(());
        }

        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=3u32 {
            match self.swap_armed(new_target).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < 3 => {
                    warn!(attempt, error = %e, "Arming failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    // Leave a clean slate so the next event reconciles from
                    // scratch instead of trusting half-written state.
                    error!(error = %e, "Arming failed after retries, clearing state");
                    self.state.clear().await.ok();
                    return Err(Error::SchedulerReconciliation {
                        message: e.to_string(),
                    });
                }
            }
        }
        unreachable!("retry loop returns on every path")
    }

    async fn swap_armed(&self, new_target: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(job_id) = self.state.active_job_id().await? {
            match self.queue.remove(SCHEDULER_TICK_QUEUE, &job_id).await {
                Ok(RemoveOutcome::Active) => {
                    debug!(job_id = %job_id, "Armed tick is executing, leaving it to self-consume");
                }
                Ok(_) => {}
                Err(e) => {
                    // Removal is best-effort; a leftover tick only causes a
                    // harmless extra sweep.
                    debug!(job_id = %job_id, error = %e, "Tick removal error swallowed");
                }
            }
        }

        let Some(target) = new_target else {
            self.state.clear().await?;
            debug!("No scheduled posts, tick disarmed");
            return Ok(());
        };

        let job_id = tick_job_id(target);
        let job = Job::new(&job_id, &SchedulerTickJob { check_time: target })?.schedule_at(target);
        // A duplicate id means the exact tick is already armed.
        self.queue.enqueue(job).await?;
        self.state.set_armed(target, &job_id).await?;

        debug!(job_id = %job_id, target = %target, "Tick armed");
        Ok(())
    }
}

/// New target for the cheap arming path: the earlier of the currently armed
/// instant and the candidate.
fn merge_target(current: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    match current {
        Some(current) => cmp::min(current, candidate),
        None => candidate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_merge_target_prefers_earlier() {
        let now = Utc::now();
        let sooner = now + ChronoDuration::seconds(10);
        let later = now + ChronoDuration::seconds(60);

        assert_eq!(merge_target(None, later), later);
        assert_eq!(merge_target(Some(sooner), later), sooner);
        assert_eq!(merge_target(Some(later), sooner), sooner);
    }

    #[test]
    fn test_tick_job_id_is_deterministic() {
        let target = Utc::now();
        assert_eq!(tick_job_id(target), tick_job_id(target));
    }
}
