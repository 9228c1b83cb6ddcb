//! Failure classification and rollback policy.
//!
//! Three categories drive what happens to the post after a failed attempt:
//! FATAL marks it failed, RETRYABLE rolls it back for another queue
//! attempt, TRANSIENT leaves the row untouched and lets the queue retry
//! with fresh data.

use threadline_core::ErrorCategory;
use threadline_database::Post;
use threadline_platform::PublishError;

/// How the post reached the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOrigin {
    /// Dispatched by the scheduler tick
    Scheduled { recurring: bool },
    /// Enqueued directly by a publish-now command
    Manual,
}

impl PublishOrigin {
    pub fn of(post: &Post) -> Self {
        if post.scheduled_at.is_some() {
            PublishOrigin::Scheduled {
                recurring: post.is_recurring(),
            }
        } else {
            PublishOrigin::Manual
        }
    }
}

/// What to do with the post after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Terminal failure: write FAILED with the error details
    MarkFailed,
    /// Roll back to SCHEDULED and let the queue retry
    RollbackScheduled,
    /// Roll back to DRAFT and let the queue retry
    RollbackDraft,
    /// Terminal for a recurring post: back to SCHEDULED, no more retries
    ParkScheduled,
    /// Write nothing; rethrow so the queue retries with backoff
    LeaveUntouched,
}

/// Pick the rollback target for a failed attempt.
///
/// `last_attempt` is true when the queue has no retries left for this job.
pub fn disposition(
    category: ErrorCategory,
    origin: PublishOrigin,
    last_attempt: bool,
) -> FailureDisposition {
    match category {
        ErrorCategory::Fatal => FailureDisposition::MarkFailed,
        ErrorCategory::Transient => FailureDisposition::LeaveUntouched,
        ErrorCategory::Retryable => {
            if last_attempt {
                match origin {
                    PublishOrigin::Scheduled { recurring: true } => {
                        FailureDisposition::ParkScheduled
                    }
                    _ => FailureDisposition::MarkFailed,
                }
            } else {
                match origin {
                    PublishOrigin::Scheduled { .. } => FailureDisposition::RollbackScheduled,
                    PublishOrigin::Manual => FailureDisposition::RollbackDraft,
                }
            }
        }
    }
}

/// Operator guidance stored alongside the error
pub fn suggested_action(error: &PublishError) -> String {
    match error {
        PublishError::TokenExpired { .. } => {
            "Reconnect the Threads account to refresh its access token".to_string()
        }
        PublishError::Authentication { .. } => {
            "Reconnect the Threads account; the stored credential was rejected".to_string()
        }
        PublishError::Permission { .. } => {
            "Check that the connected account has permission to publish".to_string()
        }
        PublishError::InvalidMedia { .. } => {
            "Check that every media URL is publicly reachable and in a supported format"
                .to_string()
        }
        PublishError::ContentTooLong { .. } => {
            "Shorten the post to at most 500 characters".to_string()
        }
        PublishError::RateLimited { .. } => {
            "Wait a few minutes; the platform is rate limiting this account".to_string()
        }
        PublishError::MediaProcessing { .. } => {
            "The platform could not process the media; try re-uploading it".to_string()
        }
        PublishError::BadRequest { .. } => {
            "Review the post content; the platform rejected the request".to_string()
        }
        PublishError::Unavailable { .. }
        | PublishError::Timeout { .. }
        | PublishError::Network { .. }
        | PublishError::DeadlineExceeded => {
            "Temporary platform problem; the post will be retried automatically".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_always_marks_failed() {
        for origin in [
            PublishOrigin::Manual,
            PublishOrigin::Scheduled { recurring: true },
            PublishOrigin::Scheduled { recurring: false },
        ] {
            assert_eq!(
                disposition(ErrorCategory::Fatal, origin, false),
                FailureDisposition::MarkFailed
            );
        }
    }

    #[test]
    fn test_transient_never_touches_the_post() {
        assert_eq!(
            disposition(ErrorCategory::Transient, PublishOrigin::Manual, true),
            FailureDisposition::LeaveUntouched
        );
    }

    #[test]
    fn test_retryable_rolls_back_by_origin() {
        assert_eq!(
            disposition(
                ErrorCategory::Retryable,
                PublishOrigin::Scheduled { recurring: false },
                false
            ),
            FailureDisposition::RollbackScheduled
        );
        assert_eq!(
            disposition(ErrorCategory::Retryable, PublishOrigin::Manual, false),
            FailureDisposition::RollbackDraft
        );
    }

    #[test]
    fn test_retryable_exhaustion_targets() {
        // One-off scheduled posts fail terminally; recurring posts park in
        // SCHEDULED so the next occurrence still fires.
        assert_eq!(
            disposition(
                ErrorCategory::Retryable,
                PublishOrigin::Scheduled { recurring: false },
                true
            ),
            FailureDisposition::MarkFailed
        );
        assert_eq!(
            disposition(
                ErrorCategory::Retryable,
                PublishOrigin::Scheduled { recurring: true },
                true
            ),
            FailureDisposition::ParkScheduled
        );
        assert_eq!(
            disposition(ErrorCategory::Retryable, PublishOrigin::Manual, true),
            FailureDisposition::MarkFailed
        );
    }

    #[test]
    fn test_suggested_action_mentions_token_refresh() {
        let action = suggested_action(&PublishError::TokenExpired {
            message: "code 190".to_string(),
        });
        assert!(action.to_lowercase().contains("token"));
    }
}
