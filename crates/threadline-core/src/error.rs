//! Unified error types for Threadline using thiserror.
//!
//! Provides consistent error handling across all components, plus the
//! three-way publish classification (fatal / retryable / transient) that
//! drives rollback behaviour in the worker pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The unified error type for Threadline operations
#[derive(Error, Debug)]
pub enum Error {
    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    /// Optimistic concurrency failure: the row version moved underneath us.
    #[error("Version conflict on {entity_type} {id}: expected version {expected}")]
    Conflict {
        entity_type: String,
        id: String,
        expected: i64,
    },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Invalid input: {field} - {message}")]
    InvalidInput { field: String, message: String },

    // Credential errors
    #[error("Credential not found for account {account_id}")]
    CredentialNotFound { account_id: String },

    #[error("Access token expired for account {account_id}")]
    TokenExpired { account_id: String },

    // Queue errors
    #[error("Queue error: {message}")]
    Queue {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Job error: {job_id} - {message}")]
    Job { job_id: String, message: String },

    // Scheduler errors
    #[error("Scheduler lock is held by another process")]
    SchedulerLockHeld,

    #[error("Scheduler reconciliation failed: {message}")]
    SchedulerReconciliation { message: String },

    // Platform errors
    #[error("Platform error: {message}")]
    Platform {
        message: String,
        category: ErrorCategory,
    },

    /// The post's execution lock is held by another worker; the job should
    /// exit as skipped rather than fail.
    #[error("Post {post_id} is locked by {locked_by}")]
    LockContention { post_id: String, locked_by: String },

    #[error("Duplicate content: identical post {existing_id} published at {published_at}")]
    DuplicateContent {
        existing_id: String,
        published_at: String,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Deadline exceeded after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    // Serialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    // Shutdown errors
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    // Generic wrapped error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Classification of a publish failure, stored on the post and used to pick
/// the rollback target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Unrecoverable: the post goes to FAILED and is never auto-retried.
    Fatal,
    /// Recoverable with fresh input: the post rolls back and the queue
    /// retries within its attempt budget.
    Retryable,
    /// Infrastructure hiccup: nothing is written to the post; the queue
    /// retries with backoff.
    Transient,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Fatal => write!(f, "FATAL"),
            ErrorCategory::Retryable => write!(f, "RETRYABLE"),
            ErrorCategory::Transient => write!(f, "TRANSIENT"),
        }
    }
}

/// Validation errors container
#[derive(Debug, Clone)]
pub struct ValidationErrors {
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result<T>(self, value: T) -> Result<T> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

/// A single validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Error {
    /// Create a database error
    pub fn database(message: impl Into<String>) -> Self {
        Error::Database {
            message: message.into(),
            source: None,
        }
    }

    /// Create a database error with source
    pub fn database_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Database {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a not found error
    pub fn not_found(entity_type: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity_type: entity_type.into(),
            id: id.to_string(),
        }
    }

    /// Create a version conflict error
    pub fn conflict(entity_type: impl Into<String>, id: impl fmt::Display, expected: i64) -> Self {
        Error::Conflict {
            entity_type: entity_type.into(),
            id: id.to_string(),
            expected,
        }
    }

    /// Create a queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Error::Queue {
            message: message.into(),
            source: None,
        }
    }

    /// Create a queue error with source
    pub fn queue_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Queue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error from a single message
    pub fn validation(message: impl Into<String>) -> Self {
        let msg = message.into();
        let mut errors = ValidationErrors::new();
        errors.add("validation", &msg);
        Error::Validation(errors)
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        Error::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a network error with source
    pub fn network_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Error::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a platform error with an explicit category
    pub fn platform(message: impl Into<String>, category: ErrorCategory) -> Self {
        Error::Platform {
            message: message.into(),
            category,
        }
    }

    /// The publish classification for this error.
    ///
    /// Infrastructure failures (store, queue, network) and version conflicts
    /// are transient: the queue retries them with fresh data. Credential and
    /// duplicate failures are fatal. Platform errors carry their own
    /// category from the adapter's envelope inspection.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Platform { category, .. } => *category,
            Error::TokenExpired { .. }
            | Error::CredentialNotFound { .. }
            | Error::DuplicateContent { .. } => ErrorCategory::Fatal,
            Error::Database { .. }
            | Error::Conflict { .. }
            | Error::Queue { .. }
            | Error::Network { .. }
            | Error::DeadlineExceeded { .. }
            | Error::ShutdownInProgress => ErrorCategory::Transient,
            _ => ErrorCategory::Retryable,
        }
    }

    /// Whether the queue should retry a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.category(), ErrorCategory::Fatal)
    }
}

/// Result type alias for Threadline operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_is_transient() {
        let err = Error::conflict("Post", "abc", 4);
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_token_expired_is_fatal() {
        let err = Error::TokenExpired {
            account_id: "acct-1".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_platform_error_keeps_category() {
        let err = Error::platform("image rejected", ErrorCategory::Retryable);
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn test_validation_errors() {
        let mut errors = ValidationErrors::new();
        assert!(errors.is_empty());

        errors.add("content", "must not be empty");
        errors.add("scheduled_at", "must be in the future");

        assert!(!errors.is_empty());
        assert_eq!(errors.errors.len(), 2);

        let err = Error::Validation(errors);
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn test_category_serde_round_trip() {
        let json = serde_json::to_string(&ErrorCategory::Transient).unwrap();
        assert_eq!(json, "\"TRANSIENT\"");
        let back: ErrorCategory = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorCategory::Transient);
    }
}
