//! Platform adapter contract and shared types.

use crate::error::PublishError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Account identity the adapter publishes as
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: String,
    pub access_token: String,
}

/// Media attached to a publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Media {
    Text,
    Image { url: String },
    Video { url: String },
    Carousel { urls: Vec<String> },
}

/// One publish invocation
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub credentials: Credentials,
    pub content: String,
    pub media: Media,
    /// Optional reply posted after the main post
    pub comment: Option<String>,
    /// Suppress the comment even when present (comment-only retries go
    /// through `publish_comment` instead)
    pub skip_comment: bool,
    /// Absolute deadline derived from the job lock; every inner request
    /// must finish before it
    pub deadline: Option<Instant>,
}

/// Phases reported through the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    Validating,
    CreatingContainers { count: usize },
    WaitingForMedia,
    Publishing,
    PostingComment,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStep::Validating => write!(f, "Validating"),
            PublishStep::CreatingContainers { count } => {
                write!(f, "Creating {} containers", count)
            }
            PublishStep::WaitingForMedia => write!(f, "Waiting for media processing"),
            PublishStep::Publishing => write!(f, "Publishing"),
            PublishStep::PostingComment => write!(f, "Posting comment"),
        }
    }
}

/// Step callback; implementations must not block on it
pub type ProgressCallback = Arc<dyn Fn(PublishStep) + Send + Sync>;

/// No-op progress callback
pub fn noop_progress() -> ProgressCallback {
    Arc::new(|_| {})
}

/// Outcome of the optional reply comment. A failed comment never fails the
/// main post.
#[derive(Debug, Clone)]
pub enum CommentOutcome {
    Skipped,
    Posted { comment_id: String },
    Failed { error: PublishError },
}

/// Successful publish
#[derive(Debug, Clone)]
pub struct PublishResult {
    pub platform_post_id: String,
    pub comment: CommentOutcome,
}

/// Capability set a social platform must provide
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Stable platform tag used for adapter selection
    fn platform(&self) -> &'static str;

    /// Run the full publish protocol for one post
    async fn publish_post(
        &self,
        request: PublishRequest,
        progress: ProgressCallback,
    ) -> Result<PublishResult, PublishError>;

    /// Post a reply to an existing platform post
    async fn publish_comment(
        &self,
        credentials: &Credentials,
        parent_id: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> Result<String, PublishError>;

    /// Advisory reachability probe for a media URL; never a publish gate
    async fn validate_media(&self, url: &str) -> bool;
}

/// Adapter lookup by platform tag
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn PlatformAdapter>) -> &mut Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    pub fn get(&self, platform: &str) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(platform).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_labels() {
        assert_eq!(PublishStep::Validating.to_string(), "Validating");
        assert_eq!(
            PublishStep::CreatingContainers { count: 3 }.to_string(),
            "Creating 3 containers"
        );
        assert_eq!(
            PublishStep::WaitingForMedia.to_string(),
            "Waiting for media processing"
        );
    }
}
