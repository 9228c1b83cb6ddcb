//! # Threadline Platform
//!
//! The `PlatformAdapter` contract and the Meta Threads implementation:
//! container creation, readiness polling, publish, and reply comments.

pub mod adapter;
pub mod error;
pub mod threads;

pub use adapter::{
    noop_progress, AdapterRegistry, CommentOutcome, Credentials, Media, PlatformAdapter,
    ProgressCallback, PublishRequest, PublishResult, PublishStep,
};
pub use error::PublishError;
pub use threads::{ThreadsAdapter, THREADS_PLATFORM};
