//! # Threadline Publisher
//!
//! The publish worker pipeline: orchestration of one post through
//! idempotency guards, the execution lock, the platform adapter, and the
//! classification-driven rollback policy; plus the public post-lifecycle
//! commands and crash recovery.

pub mod classify;
pub mod commands;
pub mod guard;
pub mod handlers;
pub mod pipeline;
pub mod recovery;

pub use classify::{disposition, suggested_action, FailureDisposition, PublishOrigin};
pub use commands::PostCommands;
pub use guard::PublishGuard;
pub use handlers::{PublishJobHandler, SchedulerTickHandler};
pub use pipeline::PublishPipeline;
pub use recovery::{RecoveryOutcome, RecoveryService};
