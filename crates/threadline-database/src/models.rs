//! Domain models for posts, schedules, and credentials.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use threadline_core::error::{ErrorCategory, ValidationErrors};
use threadline_core::Result;
use uuid::Uuid;

/// Maximum content length in Unicode code points
pub const MAX_CONTENT_CHARS: usize = 500;

/// Maximum number of carousel items accepted by the platform
pub const MAX_CAROUSEL_ITEMS: usize = 10;

/// Post lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "publishing" => Some(PostStatus::Publishing),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of media attached to a post
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PostType {
    Text,
    Image,
    Carousel,
    Video,
}

impl PostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Text => "text",
            PostType::Image => "image",
            PostType::Carousel => "carousel",
            PostType::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(PostType::Text),
            "image" => Some(PostType::Image),
            "carousel" => Some(PostType::Carousel),
            "video" => Some(PostType::Video),
            _ => None,
        }
    }
}

/// Lifecycle of the optional reply comment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    None,
    Pending,
    Posting,
    Posted,
    Failed,
}

impl CommentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommentStatus::None => "none",
            CommentStatus::Pending => "pending",
            CommentStatus::Posting => "posting",
            CommentStatus::Posted => "posted",
            CommentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CommentStatus::None),
            "pending" => Some(CommentStatus::Pending),
            "posting" => Some(CommentStatus::Posting),
            "posted" => Some(CommentStatus::Posted),
            "failed" => Some(CommentStatus::Failed),
            _ => None,
        }
    }
}

/// Recurrence pattern
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePattern {
    Once,
    Weekly,
    Monthly,
    DateRange,
}

/// Recurrence descriptor embedded in a post.
///
/// For non-`Once` patterns, `scheduled_at` is the *next* firing instant;
/// the scheduler advances it after each successful publish.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub pattern: SchedulePattern,
    pub scheduled_at: DateTime<Utc>,
    /// Local wall-clock time of day in the configured time zone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<NaiveTime>,
    /// Days of week, 0 = Sunday .. 6 = Saturday
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

impl ScheduleConfig {
    pub fn once(scheduled_at: DateTime<Utc>) -> Self {
        Self {
            pattern: SchedulePattern::Once,
            scheduled_at,
            time: None,
            days_of_week: None,
            day_of_month: None,
            end_date: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.pattern != SchedulePattern::Once
    }
}

/// Ephemeral progress record surfaced to the UI while publishing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishingProgress {
    pub step: String,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

impl PublishingProgress {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            step: "Queued".to_string(),
            started_at: now,
            last_updated_at: now,
            status: ProgressStatus::Running,
            error: None,
        }
    }

    pub fn advance(&mut self, step: impl Into<String>, now: DateTime<Utc>) {
        self.step = step.into();
        self.last_updated_at = now;
    }
}

/// Store-side mutex preventing two workers from publishing the same post
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionLock {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ExecutionLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The unit of work: one social-media post and its lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub content: String,
    pub post_type: PostType,
    pub image_urls: Vec<String>,
    pub video_url: Option<String>,
    /// Optional reply text posted as a separate message after the main post
    pub comment: Option<String>,
    pub account_id: Option<Uuid>,
    pub status: PostStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub schedule_config: Option<ScheduleConfig>,
    pub published_at: Option<DateTime<Utc>>,
    pub platform_post_id: Option<String>,
    pub platform_comment_id: Option<String>,
    pub comment_status: CommentStatus,
    pub comment_retry_count: i32,
    pub content_hash: Option<String>,
    pub publishing_progress: Option<PublishingProgress>,
    pub execution_lock: Option<ExecutionLock>,
    pub error: Option<String>,
    pub error_category: Option<ErrorCategory>,
    pub suggested_action: Option<String>,
    /// Monotonic counter for optimistic concurrency
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Post {
    /// Create a new draft post
    pub fn new(content: impl Into<String>, post_type: PostType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            post_type,
            image_urls: Vec::new(),
            video_url: None,
            comment: None,
            account_id: None,
            status: PostStatus::Draft,
            scheduled_at: None,
            schedule_config: None,
            published_at: None,
            platform_post_id: None,
            platform_comment_id: None,
            comment_status: CommentStatus::None,
            comment_retry_count: 0,
            content_hash: None,
            publishing_progress: None,
            execution_lock: None,
            error: None,
            error_category: None,
            suggested_action: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_images(mut self, urls: Vec<String>) -> Self {
        self.image_urls = urls;
        self
    }

    pub fn with_video(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_account(mut self, account_id: Uuid) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Whether the worker pipeline may pick this post up at all.
    /// Published and failed posts are handled by dedicated guards.
    pub fn can_publish(&self) -> bool {
        matches!(
            self.status,
            PostStatus::Draft | PostStatus::Scheduled | PostStatus::Publishing
        )
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule_config
            .as_ref()
            .map(|c| c.is_recurring())
            .unwrap_or(false)
    }

    /// Validate content and media shape against platform constraints.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();

        if self.content.trim().is_empty() {
            errors.add("content", "must not be empty");
        }
        if self.content.chars().count() > MAX_CONTENT_CHARS {
            errors.add(
                "content",
                format!("exceeds {} characters", MAX_CONTENT_CHARS),
            );
        }

        match self.post_type {
            PostType::Text => {
                if !self.image_urls.is_empty() || self.video_url.is_some() {
                    errors.add("post_type", "text posts must not carry media");
                }
            }
            PostType::Image => {
                if self.image_urls.len() != 1 {
                    errors.add("image_urls", "image posts require exactly one URL");
                }
            }
            PostType::Carousel => {
                if self.image_urls.len() < 2 {
                    errors.add("image_urls", "carousels require at least two URLs");
                }
            }
            PostType::Video => {
                if self.video_url.is_none() {
                    errors.add("video_url", "video posts require a video URL");
                }
            }
        }

        errors.into_result(())
    }

    /// SHA-256 over the normalised content inputs, hex-encoded.
    ///
    /// Recomputed on every publish attempt so edits between attempts are
    /// detected by the duplicate guard.
    pub fn compute_content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.content.trim().as_bytes());
        hasher.update([0u8]);
        for (i, url) in self.image_urls.iter().enumerate() {
            if i > 0 {
                hasher.update([0u8]);
            }
            hasher.update(url.as_bytes());
        }
        hasher.update([0u8]);
        if let Some(video) = &self.video_url {
            hasher.update(video.as_bytes());
        }
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Stored platform credential, read-only to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: Uuid,
    pub platform_user_id: String,
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when the token should be refreshed before use
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.expires_at <= now + window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn text_post() -> Post {
        Post::new("Hello", PostType::Text)
    }

    #[test]
    fn test_text_post_validates() {
        assert!(text_post().validate().is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        let post = Post::new("   ", PostType::Text);
        assert!(post.validate().is_err());
    }

    #[test]
    fn test_content_length_limit_counts_code_points() {
        let post = Post::new("ư".repeat(MAX_CONTENT_CHARS), PostType::Text);
        assert!(post.validate().is_ok());
        let post = Post::new("ư".repeat(MAX_CONTENT_CHARS + 1), PostType::Text);
        assert!(post.validate().is_err());
    }

    #[test]
    fn test_text_post_rejects_media() {
        let post = text_post().with_images(vec!["https://cdn.example/a.jpg".into()]);
        assert!(post.validate().is_err());
    }

    #[test]
    fn test_carousel_requires_two_urls() {
        let post = Post::new("c", PostType::Carousel)
            .with_images(vec!["https://cdn.example/a.jpg".into()]);
        assert!(post.validate().is_err());

        let post = Post::new("c", PostType::Carousel).with_images(vec![
            "https://cdn.example/a.jpg".into(),
            "https://cdn.example/b.jpg".into(),
        ]);
        assert!(post.validate().is_ok());
    }

    #[test]
    fn test_content_hash_is_stable_and_sensitive() {
        let a = text_post();
        let b = text_post();
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());

        let c = Post::new("Hello!", PostType::Text);
        assert_ne!(a.compute_content_hash(), c.compute_content_hash());

        // Media participates in the hash
        let d = Post::new("Hello", PostType::Image)
            .with_images(vec!["https://cdn.example/a.jpg".into()]);
        assert_ne!(a.compute_content_hash(), d.compute_content_hash());
    }

    #[test]
    fn test_hash_distinguishes_url_boundaries() {
        let a = Post::new("x", PostType::Carousel)
            .with_images(vec!["ab".into(), "c".into()]);
        let b = Post::new("x", PostType::Carousel)
            .with_images(vec!["a".into(), "bc".into()]);
        assert_ne!(a.compute_content_hash(), b.compute_content_hash());
    }

    #[test]
    fn test_execution_lock_expiry() {
        let now = Utc::now();
        let lock = ExecutionLock {
            locked_by: "worker-1".into(),
            locked_at: now - Duration::minutes(10),
            expires_at: now - Duration::minutes(5),
        };
        assert!(lock.is_expired(now));
    }

    #[test]
    fn test_credential_refresh_window() {
        let now = Utc::now();
        let cred = Credential {
            id: Uuid::new_v4(),
            platform_user_id: "123".into(),
            access_token: "token".into(),
            expires_at: now + Duration::minutes(30),
        };
        assert!(!cred.is_expired(now));
        assert!(cred.expires_within(now, Duration::hours(1)));
        assert!(!cred.expires_within(now, Duration::minutes(10)));
    }

    #[test]
    fn test_recurring_detection() {
        let mut post = text_post();
        assert!(!post.is_recurring());
        post.schedule_config = Some(ScheduleConfig {
            pattern: SchedulePattern::Weekly,
            scheduled_at: Utc::now(),
            time: NaiveTime::from_hms_opt(9, 0, 0),
            days_of_week: Some(vec![1, 4]),
            day_of_month: None,
            end_date: None,
        });
        assert!(post.is_recurring());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Publishing,
            PostStatus::Published,
            PostStatus::Failed,
        ] {
            assert_eq!(PostStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PostStatus::parse("bogus"), None);
    }
}
