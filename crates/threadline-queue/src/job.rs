//! Job types and payload definitions.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use threadline_core::error::{Error, Result};
use uuid::Uuid;

/// Name of the publish queue
pub const PUBLISH_QUEUE: &str = "publish";

/// Name of the scheduler tick queue
pub const SCHEDULER_TICK_QUEUE: &str = "scheduler-tick";

/// Job lifecycle state inside the queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "delayed" => Some(JobState::Delayed),
            "waiting" => Some(JobState::Waiting),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Trait implemented by job payload types
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    /// Stable type tag stored with the job
    fn job_type() -> &'static str;

    /// Logical queue the payload belongs to
    fn queue() -> &'static str;

    fn max_attempts() -> u32 {
        3
    }

    /// Base of the exponential retry backoff in milliseconds
    fn backoff_base_ms() -> u64 {
        2_000
    }
}

/// A queued unit of work.
///
/// The id is caller-supplied: enqueueing the same id twice is a no-op, which
/// is what makes scheduler arming and tick batching idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// When the job becomes available for claiming
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create an immediately-available job with a caller-supplied id
    pub fn new<P: JobPayload>(id: impl Into<String>, payload: &P) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            id: id.into(),
            queue: P::queue().to_string(),
            job_type: P::job_type().to_string(),
            payload: serde_json::to_value(payload)
                .map_err(|e| Error::serialization(format!("Failed to encode payload: {}", e)))?,
            attempts: 0,
            max_attempts: P::max_attempts(),
            backoff_base_ms: P::backoff_base_ms(),
            available_at: now,
            created_at: now,
        })
    }

    /// Delay availability by `delay_ms` milliseconds
    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.available_at = self.created_at + chrono::Duration::milliseconds(delay_ms as i64);
        self
    }

    /// Make the job available at a specific instant
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Decode the payload into its concrete type
    pub fn decode<P: JobPayload>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| Error::serialization(format!("Failed to decode payload: {}", e)))
    }

    /// Retry delay after the given (1-based) attempt number
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        self.backoff_base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
    }
}

/// Payload of a `publish` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishJob {
    pub post_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    /// Retry only the reply comment of an already-published post
    #[serde(default)]
    pub comment_only_retry: bool,
}

impl JobPayload for PublishJob {
    fn job_type() -> &'static str {
        "publish_post"
    }

    fn queue() -> &'static str {
        PUBLISH_QUEUE
    }
}

/// Payload of a `scheduler-tick` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerTickJob {
    pub check_time: DateTime<Utc>,
}

impl JobPayload for SchedulerTickJob {
    fn job_type() -> &'static str {
        "scheduler_tick"
    }

    fn queue() -> &'static str {
        SCHEDULER_TICK_QUEUE
    }
}

/// Job id for a tick armed at `check_time`
pub fn tick_job_id(check_time: DateTime<Utc>) -> String {
    format!("scheduler-check-{}", check_time.timestamp_millis())
}

/// Job id for a publish sweep entry; `seq` keeps ids unique inside a batch
pub fn publish_job_id(post_id: Uuid, seq: i64) -> String {
    format!("publish-{}-{}", post_id, seq)
}

/// Job id for a comment-only retry
pub fn comment_retry_job_id(post_id: Uuid, at: DateTime<Utc>) -> String {
    format!("comment-retry-{}-{}", post_id, at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_round_trip() {
        let payload = PublishJob {
            post_id: Uuid::new_v4(),
            account_id: None,
            comment_only_retry: false,
        };
        let job = Job::new(publish_job_id(payload.post_id, 1), &payload).unwrap();
        assert_eq!(job.queue, PUBLISH_QUEUE);
        assert_eq!(job.job_type, "publish_post");
        assert_eq!(job.max_attempts, 3);

        let decoded: PublishJob = job.decode().unwrap();
        assert_eq!(decoded.post_id, payload.post_id);
        assert!(!decoded.comment_only_retry);
    }

    #[test]
    fn test_backoff_doubles() {
        let job = Job::new(
            "j1",
            &SchedulerTickJob {
                check_time: Utc::now(),
            },
        )
        .unwrap();
        assert_eq!(job.backoff_ms(1), 2_000);
        assert_eq!(job.backoff_ms(2), 4_000);
        assert_eq!(job.backoff_ms(3), 8_000);
    }

    #[test]
    fn test_delay_shifts_availability() {
        let payload = SchedulerTickJob {
            check_time: Utc::now(),
        };
        let job = Job::new("j2", &payload).unwrap().delay_ms(1_500);
        assert_eq!(
            (job.available_at - job.created_at).num_milliseconds(),
            1_500
        );
    }

    #[test]
    fn test_job_id_builders() {
        let post_id = Uuid::nil();
        assert!(publish_job_id(post_id, 42).starts_with("publish-"));
        assert!(publish_job_id(post_id, 42).ends_with("-42"));

        let at = DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            tick_job_id(at),
            format!("scheduler-check-{}", at.timestamp_millis())
        );
        assert!(comment_retry_job_id(post_id, at).starts_with("comment-retry-"));
    }

    #[test]
    fn test_comment_only_retry_defaults_false() {
        let decoded: PublishJob =
            serde_json::from_str(&format!("{{\"post_id\":\"{}\"}}", Uuid::nil())).unwrap();
        assert!(!decoded.comment_only_retry);
    }
}
