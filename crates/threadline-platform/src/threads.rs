//! Meta Threads adapter.
//!
//! Publish protocol: create a media container (plus child containers for
//! carousels), poll the container until the platform reports `FINISHED`,
//! publish it, then optionally post the reply comment after a pause. Every
//! HTTP call and poll iteration honours the caller's job deadline.

use crate::adapter::{
    CommentOutcome, Credentials, Media, PlatformAdapter, ProgressCallback, PublishRequest,
    PublishResult, PublishStep,
};
use crate::error::PublishError;
use async_trait::async_trait;
use std::time::Duration;
use threadline_core::config::PlatformConfig;
use threadline_core::error::{Error, Result};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Platform tag for adapter selection
pub const THREADS_PLATFORM: &str = "threads";

const VIDEO_EXTENSIONS: [&str; 8] = [
    ".mp4", ".mov", ".avi", ".webm", ".mkv", ".flv", ".wmv", ".m4v",
];

/// Carousel URL media kind, decided by file extension
fn media_kind_for_url(url: &str) -> &'static str {
    let path = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .to_ascii_lowercase();
    if VIDEO_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        "VIDEO"
    } else {
        "IMAGE"
    }
}

fn check_deadline(deadline: Option<Instant>) -> std::result::Result<(), PublishError> {
    match deadline {
        Some(d) if Instant::now() >= d => Err(PublishError::DeadlineExceeded),
        _ => Ok(()),
    }
}

/// Threads Graph API adapter
pub struct ThreadsAdapter {
    http: reqwest::Client,
    config: PlatformConfig,
}

impl ThreadsAdapter {
    pub fn new(config: PlatformConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_root(), path)
    }

    /// Remaining time budget for one request
    fn bounded_timeout(&self, deadline: Option<Instant>) -> Duration {
        let base = self.config.request_timeout();
        match deadline {
            Some(d) => base.min(d.saturating_duration_since(Instant::now())),
            None => base,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        deadline: Option<Instant>,
    ) -> std::result::Result<serde_json::Value, PublishError> {
        check_deadline(deadline)?;

        let response = tokio::time::timeout(self.bounded_timeout(deadline), request.send())
            .await
            .map_err(|_| match deadline {
                Some(d) if Instant::now() >= d => PublishError::DeadlineExceeded,
                _ => PublishError::Timeout {
                    message: "request exceeded its time budget".to_string(),
                },
            })?
            .map_err(map_reqwest)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_reqwest)?;

        if !(200..300).contains(&status) {
            return Err(PublishError::from_response(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| PublishError::BadRequest {
            message: format!("unexpected response body: {}", e),
        })
    }

    /// POST a container creation and return its id
    async fn create_container(
        &self,
        credentials: &Credentials,
        params: Vec<(&'static str, String)>,
        deadline: Option<Instant>,
    ) -> std::result::Result<String, PublishError> {
        let mut form = params;
        form.push(("access_token", credentials.access_token.clone()));

        let url = self.url(&format!("{}/threads", credentials.user_id));
        let value = self.execute(self.http.post(&url).form(&form), deadline).await?;

        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PublishError::BadRequest {
                message: "container response carried no id".to_string(),
            })
    }

    /// Poll a container until FINISHED, within the ceiling and the deadline
    async fn wait_until_ready(
        &self,
        container_id: &str,
        access_token: &str,
        deadline: Option<Instant>,
    ) -> std::result::Result<(), PublishError> {
        let started = Instant::now();
        let ceiling = Duration::from_secs(self.config.poll_ceiling_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        let url = self.url(container_id);

        loop {
            check_deadline(deadline)?;

            let value = self
                .execute(
                    self.http.get(&url).query(&[
                        ("fields", "status,error_message"),
                        ("access_token", access_token),
                    ]),
                    deadline,
                )
                .await?;

            let status = value["status"].as_str().unwrap_or("");
            match status {
                "FINISHED" => return Ok(()),
                "IN_PROGRESS" | "PUBLISHED" => {
                    debug!(container_id, status, "Container not ready yet");
                }
                other => {
                    let message = value["error_message"].as_str().unwrap_or("none given");
                    return Err(PublishError::MediaProcessing {
                        message: format!(
                            "container {} entered state {}: {}",
                            container_id, other, message
                        ),
                    });
                }
            }

            if started.elapsed() >= ceiling {
                return Err(PublishError::Timeout {
                    message: format!(
                        "container {} not ready within {}s",
                        container_id, self.config.poll_ceiling_secs
                    ),
                });
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// POST `threads_publish` for a finished container
    async fn publish_container(
        &self,
        credentials: &Credentials,
        container_id: &str,
        deadline: Option<Instant>,
    ) -> std::result::Result<String, PublishError> {
        let url = self.url(&format!("{}/threads_publish", credentials.user_id));
        let form = [
            ("creation_id", container_id.to_string()),
            ("access_token", credentials.access_token.clone()),
        ];
        let value = self.execute(self.http.post(&url).form(&form), deadline).await?;

        value["id"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| PublishError::BadRequest {
                message: "publish response carried no id".to_string(),
            })
    }

    /// Full container pipeline for the request's media shape
    async fn build_container(
        &self,
        request: &PublishRequest,
        progress: &ProgressCallback,
    ) -> std::result::Result<String, PublishError> {
        let credentials = &request.credentials;
        let deadline = request.deadline;

        match &request.media {
            Media::Text => {
                progress(PublishStep::CreatingContainers { count: 1 });
                self.create_container(
                    credentials,
                    vec![
                        ("media_type", "TEXT".to_string()),
                        ("text", request.content.clone()),
                    ],
                    deadline,
                )
                .await
            }
            Media::Image { url } => {
                progress(PublishStep::CreatingContainers { count: 1 });
                self.create_container(
                    credentials,
                    vec![
                        ("media_type", "IMAGE".to_string()),
                        ("image_url", url.clone()),
                        ("text", request.content.clone()),
                    ],
                    deadline,
                )
                .await
            }
            Media::Video { url } => {
                progress(PublishStep::CreatingContainers { count: 1 });
                self.create_container(
                    credentials,
                    vec![
                        ("media_type", "VIDEO".to_string()),
                        ("video_url", url.clone()),
                        ("text", request.content.clone()),
                    ],
                    deadline,
                )
                .await
            }
            Media::Carousel { urls } => {
                // The platform caps carousels at ten items; extras are
                // silently dropped.
                let urls: Vec<&String> = urls.iter().take(10).collect();
                progress(PublishStep::CreatingContainers {
                    count: urls.len() + 1,
                });

                let mut children = Vec::with_capacity(urls.len());
                for url in &urls {
                    let kind = media_kind_for_url(url);
                    let url_field = if kind == "VIDEO" { "video_url" } else { "image_url" };
                    let child = self
                        .create_container(
                            credentials,
                            vec![
                                ("media_type", kind.to_string()),
                                (url_field, (*url).clone()),
                                ("is_carousel_item", "true".to_string()),
                            ],
                            deadline,
                        )
                        .await?;
                    children.push(child);
                }

                progress(PublishStep::WaitingForMedia);
                for child in &children {
                    self.wait_until_ready(child, &credentials.access_token, deadline)
                        .await?;
                }

                self.create_container(
                    credentials,
                    vec![
                        ("media_type", "CAROUSEL".to_string()),
                        ("children", children.join(",")),
                        ("text", request.content.clone()),
                    ],
                    deadline,
                )
                .await
            }
        }
    }

    /// Create, await, and publish a TEXT reply container
    async fn comment_inner(
        &self,
        credentials: &Credentials,
        parent_id: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> std::result::Result<String, PublishError> {
        let container = self
            .create_container(
                credentials,
                vec![
                    ("media_type", "TEXT".to_string()),
                    ("text", text.to_string()),
                    ("reply_to_id", parent_id.to_string()),
                ],
                deadline,
            )
            .await?;
        self.wait_until_ready(&container, &credentials.access_token, deadline)
            .await?;
        self.publish_container(credentials, &container, deadline).await
    }

    /// Deadline-aware pause before commenting
    async fn comment_pause(&self, deadline: Option<Instant>) {
        let mut delay = Duration::from_secs(self.config.comment_delay_secs);
        if let Some(d) = deadline {
            delay = delay.min(d.saturating_duration_since(Instant::now()));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PlatformAdapter for ThreadsAdapter {
    fn platform(&self) -> &'static str {
        THREADS_PLATFORM
    }

    async fn publish_post(
        &self,
        request: PublishRequest,
        progress: ProgressCallback,
    ) -> std::result::Result<PublishResult, PublishError> {
        progress(PublishStep::Validating);

        let container_id = self.build_container(&request, &progress).await?;

        progress(PublishStep::WaitingForMedia);
        self.wait_until_ready(
            &container_id,
            &request.credentials.access_token,
            request.deadline,
        )
        .await?;

        progress(PublishStep::Publishing);
        let platform_post_id = self
            .publish_container(&request.credentials, &container_id, request.deadline)
            .await?;
        debug!(platform_post_id = %platform_post_id, "Post published");

        let comment = match &request.comment {
            Some(text) if !request.skip_comment && !text.trim().is_empty() => {
                progress(PublishStep::PostingComment);
                self.comment_pause(request.deadline).await;
                match self
                    .comment_inner(&request.credentials, &platform_post_id, text, request.deadline)
                    .await
                {
                    Ok(comment_id) => CommentOutcome::Posted { comment_id },
                    Err(error) => {
                        warn!(platform_post_id = %platform_post_id, error = %error,
                              "Comment failed; post already published");
                        CommentOutcome::Failed { error }
                    }
                }
            }
            _ => CommentOutcome::Skipped,
        };

        Ok(PublishResult {
            platform_post_id,
            comment,
        })
    }

    async fn publish_comment(
        &self,
        credentials: &Credentials,
        parent_id: &str,
        text: &str,
        deadline: Option<Instant>,
    ) -> std::result::Result<String, PublishError> {
        self.comment_inner(credentials, parent_id, text, deadline).await
    }

    async fn validate_media(&self, url: &str) -> bool {
        let timeout = Duration::from_secs(self.config.media_check_timeout_secs);
        match tokio::time::timeout(timeout, self.http.head(url).send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }
}

fn map_reqwest(e: reqwest::Error) -> PublishError {
    if e.is_timeout() {
        PublishError::Timeout {
            message: e.to_string(),
        }
    } else {
        PublishError::Network {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::noop_progress;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> PlatformConfig {
        PlatformConfig {
            base_url,
            api_version: "v1.0".to_string(),
            request_timeout_secs: 5,
            media_check_timeout_secs: 1,
            poll_interval_secs: 0,
            poll_ceiling_secs: 5,
            comment_delay_secs: 0,
        }
    }

    fn request(media: Media, comment: Option<&str>) -> PublishRequest {
        PublishRequest {
            credentials: Credentials {
                user_id: "u1".to_string(),
                access_token: "tok".to_string(),
            },
            content: "Hello".to_string(),
            media,
            comment: comment.map(String::from),
            skip_comment: false,
            deadline: None,
        }
    }

    #[test]
    fn test_media_kind_by_extension() {
        assert_eq!(media_kind_for_url("https://cdn.example/a.MP4"), "VIDEO");
        assert_eq!(media_kind_for_url("https://cdn.example/a.mov?sig=x"), "VIDEO");
        assert_eq!(media_kind_for_url("https://cdn.example/a.jpg"), "IMAGE");
        assert_eq!(media_kind_for_url("https://cdn.example/a.png#frag"), "IMAGE");
    }

    #[tokio::test]
    async fn test_text_post_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "FINISHED"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "p-1"})))
            .mount(&server)
            .await;

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        let result = adapter
            .publish_post(request(Media::Text, None), noop_progress())
            .await
            .unwrap();

        assert_eq!(result.platform_post_id, "p-1");
        assert!(matches!(result.comment, CommentOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_carousel_creates_child_containers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c-1"})))
            .expect(4) // three children plus the outer carousel
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "FINISHED"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "p-9"})))
            .mount(&server)
            .await;

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        let media = Media::Carousel {
            urls: vec![
                "https://cdn.example/a.jpg".to_string(),
                "https://cdn.example/b.mp4".to_string(),
                "https://cdn.example/c.jpg".to_string(),
            ],
        };
        let result = adapter
            .publish_post(request(media, None), noop_progress())
            .await
            .unwrap();
        assert_eq!(result.platform_post_id, "p-9");
    }

    #[tokio::test]
    async fn test_token_expired_surfaces_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Error validating access token", "code": 190}
            })))
            .mount(&server)
            .await;

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        let err = adapter
            .publish_post(request(Media::Text, None), noop_progress())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::TokenExpired { .. }));
    }

    #[tokio::test]
    async fn test_comment_failure_keeps_post_success() {
        let server = MockServer::start().await;
        // Main-post container succeeds; the reply container (reply_to_id) 500s.
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .and(body_string_contains("reply_to_id"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "FINISHED"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "p-1"})))
            .mount(&server)
            .await;

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        let result = adapter
            .publish_post(request(Media::Text, Some("a reply")), noop_progress())
            .await
            .unwrap();

        assert_eq!(result.platform_post_id, "p-1");
        match result.comment {
            CommentOutcome::Failed { error } => {
                assert!(matches!(error, PublishError::Unavailable { .. }));
            }
            other => panic!("expected failed comment, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_container_error_state_fails_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ERROR", "error_message": "video codec unsupported"
            })))
            .mount(&server)
            .await;

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        let err = adapter
            .publish_post(
                request(
                    Media::Video {
                        url: "https://cdn.example/v.mp4".to_string(),
                    },
                    None,
                ),
                noop_progress(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::MediaProcessing { .. }));
    }

    #[tokio::test]
    async fn test_progress_steps_reported_in_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "c-1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1.0/c-1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "FINISHED"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/u1/threads_publish"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "p-1"})))
            .mount(&server)
            .await;

        let steps = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = steps.clone();
        let progress: ProgressCallback =
            std::sync::Arc::new(move |step| recorded.lock().unwrap().push(step));

        let adapter = ThreadsAdapter::new(test_config(server.uri())).unwrap();
        adapter
            .publish_post(request(Media::Text, None), progress)
            .await
            .unwrap();

        let steps = steps.lock().unwrap();
        assert_eq!(
            *steps,
            vec![
                PublishStep::Validating,
                PublishStep::CreatingContainers { count: 1 },
                PublishStep::WaitingForMedia,
                PublishStep::Publishing,
            ]
        );
    }
}
