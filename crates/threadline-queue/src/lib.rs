//! # Threadline Queue
//!
//! Durable, Redis-backed delayed job queue with idempotent enqueue by job
//! id, attempt counting, exponential backoff, stalled-job recovery, and a
//! worker runtime with bounded concurrency and request rate limiting.

pub mod job;
pub mod queue;
pub mod worker;

pub use job::{
    comment_retry_job_id, publish_job_id, tick_job_id, Job, JobPayload, JobState, PublishJob,
    SchedulerTickJob, PUBLISH_QUEUE, SCHEDULER_TICK_QUEUE,
};
pub use queue::{
    connect, EnqueueOutcome, JobQueue, Queue, QueueConfig, QueueDepth, RemoveOutcome, RetryOutcome,
    StalledJob,
};
pub use worker::{JobHandler, QueueWorkerOptions, RateLimiter, WorkerPool};
