//! Platform error surfacing.
//!
//! HTTP failures are mapped into a structured `PublishError` by inspecting
//! the platform's error envelope; the variant determines the publish
//! classification the worker uses for rollback.

use serde::Deserialize;
use thiserror::Error;
use threadline_core::ErrorCategory;

/// A structured failure from a platform adapter
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Access token expired: {message}")]
    TokenExpired { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Permission denied: {message}")]
    Permission { message: String },

    #[error("Invalid media: {message}")]
    InvalidMedia { message: String },

    #[error("Content too long: {message}")]
    ContentTooLong { message: String },

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// The platform reported a failed or expired media container
    #[error("Media processing failed: {message}")]
    MediaProcessing { message: String },

    /// Unclassified 4xx
    #[error("Platform rejected the request: {message}")]
    BadRequest { message: String },

    #[error("Platform unavailable: {message}")]
    Unavailable { message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Job deadline exceeded")]
    DeadlineExceeded,
}

/// Error envelope returned by the Graph API
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<EnvelopeBody>,
}

#[derive(Debug, Deserialize, Default)]
struct EnvelopeBody {
    #[serde(default)]
    message: String,
    code: Option<i64>,
}

impl PublishError {
    /// Map an HTTP status + body into a structured error per the platform's
    /// envelope conventions.
    pub fn from_response(status: u16, body: &str) -> Self {
        let envelope: EnvelopeBody = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|e| e.error)
            .unwrap_or_default();
        let message = if envelope.message.is_empty() {
            truncate(body, 300)
        } else {
            envelope.message.clone()
        };
        let lower = message.to_lowercase();

        if envelope.code == Some(190) || lower.contains("expired") {
            return PublishError::TokenExpired { message };
        }

        match status {
            401 => PublishError::Authentication { message },
            403 => PublishError::Permission { message },
            429 => PublishError::RateLimited { message },
            400 => {
                if lower.contains("rate limit")
                    || lower.contains("too many")
                    || matches!(envelope.code, Some(4) | Some(17))
                {
                    PublishError::RateLimited { message }
                } else if lower.contains("image") || lower.contains("video") || lower.contains("media")
                {
                    PublishError::InvalidMedia { message }
                } else if lower.contains("too long")
                    || lower.contains("length")
                    || lower.contains("character")
                {
                    PublishError::ContentTooLong { message }
                } else {
                    PublishError::BadRequest { message }
                }
            }
            s if s >= 500 => PublishError::Unavailable { message },
            _ => PublishError::BadRequest { message },
        }
    }

    /// The rollback classification of this failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            PublishError::TokenExpired { .. }
            | PublishError::Authentication { .. }
            | PublishError::Permission { .. } => ErrorCategory::Fatal,
            PublishError::InvalidMedia { .. }
            | PublishError::ContentTooLong { .. }
            | PublishError::RateLimited { .. }
            | PublishError::MediaProcessing { .. }
            | PublishError::BadRequest { .. } => ErrorCategory::Retryable,
            PublishError::Unavailable { .. }
            | PublishError::Timeout { .. }
            | PublishError::Network { .. }
            | PublishError::DeadlineExceeded => ErrorCategory::Transient,
        }
    }

    /// True for failures on the platform's side (used by comment retry)
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            PublishError::Unavailable { .. }
                | PublishError::Timeout { .. }
                | PublishError::Network { .. }
        )
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_190_is_token_expired() {
        let body = r#"{"error":{"message":"Error validating access token","code":190}}"#;
        let err = PublishError::from_response(400, body);
        assert!(matches!(err, PublishError::TokenExpired { .. }));
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_expired_message_is_token_expired() {
        let body = r#"{"error":{"message":"Session has expired on Monday"}}"#;
        let err = PublishError::from_response(400, body);
        assert!(matches!(err, PublishError::TokenExpired { .. }));
    }

    #[test]
    fn test_401_is_authentication_fatal() {
        let err = PublishError::from_response(401, r#"{"error":{"message":"bad token"}}"#);
        assert!(matches!(err, PublishError::Authentication { .. }));
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_403_is_permission_fatal() {
        let err = PublishError::from_response(403, r#"{"error":{"message":"not allowed"}}"#);
        assert!(matches!(err, PublishError::Permission { .. }));
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_400_media_message_is_invalid_media() {
        let err = PublishError::from_response(
            400,
            r#"{"error":{"message":"The image URL could not be fetched"}}"#,
        );
        assert!(matches!(err, PublishError::InvalidMedia { .. }));
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn test_400_rate_limit_signals() {
        for body in [
            r#"{"error":{"message":"Application request rate limit reached"}}"#,
            r#"{"error":{"message":"Too many requests"}}"#,
            r#"{"error":{"message":"throttled","code":4}}"#,
            r#"{"error":{"message":"throttled","code":17}}"#,
        ] {
            let err = PublishError::from_response(400, body);
            assert!(matches!(err, PublishError::RateLimited { .. }), "{}", body);
        }
    }

    #[test]
    fn test_429_is_rate_limited() {
        let err = PublishError::from_response(429, "{}");
        assert!(matches!(err, PublishError::RateLimited { .. }));
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn test_400_length_is_content_too_long() {
        let err = PublishError::from_response(
            400,
            r#"{"error":{"message":"Param text must be at most 500 characters"}}"#,
        );
        assert!(matches!(err, PublishError::ContentTooLong { .. }));
    }

    #[test]
    fn test_5xx_is_transient() {
        let err = PublishError::from_response(503, "Service Unavailable");
        assert!(matches!(err, PublishError::Unavailable { .. }));
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_unparseable_body_falls_back_to_raw_text() {
        let err = PublishError::from_response(400, "<html>weird</html>");
        assert!(matches!(err, PublishError::BadRequest { .. }));
    }

    #[test]
    fn test_server_error_detection() {
        assert!(PublishError::Unavailable {
            message: "x".into()
        }
        .is_server_error());
        assert!(!PublishError::BadRequest {
            message: "x".into()
        }
        .is_server_error());
    }
}
