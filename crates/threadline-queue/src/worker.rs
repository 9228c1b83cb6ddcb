//! Worker runtime: claims jobs and drives registered handlers.
//!
//! Each logical queue gets a consumer loop with semaphore-bounded
//! concurrency and an optional rolling-window rate limiter, plus a promoter
//! loop for delayed jobs and a stalled-recovery loop. A heartbeat task
//! extends the active lock while a handler runs.

use crate::job::Job;
use crate::queue::{Queue, RetryOutcome, StalledJob};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use threadline_core::error::Result;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handler for one job type
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type tag this handler consumes
    fn job_type(&self) -> &'static str;

    /// Process one job. A returned error is reported to the queue, which
    /// retries or fails the job depending on `Error::is_retryable`.
    async fn handle(&self, job: &Job) -> Result<()>;

    /// Called when a job of this type was reclaimed by stalled recovery.
    /// `failed` is true when the stall budget was exhausted.
    async fn on_stalled(&self, _stalled: &StalledJob) -> Result<()> {
        Ok(())
    }
}

/// Rolling-window request limiter
pub struct RateLimiter {
    max: usize,
    window: Duration,
    stamps: Mutex<std::collections::VecDeque<tokio::time::Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            stamps: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Wait until a request slot is free in the rolling window
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.stamps.lock().await;
                let now = tokio::time::Instant::now();
                while let Some(front) = stamps.front() {
                    if *front + self.window <= now {
                        stamps.pop_front();
                    } else {
                        break;
                    }
                }
                if stamps.len() < self.max {
                    stamps.push_back(now);
                    return;
                }
                *stamps.front().expect("non-empty at capacity") + self.window - now
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Options for one queue's consumer loop
#[derive(Clone)]
pub struct QueueWorkerOptions {
    pub concurrency: usize,
    pub rate_limit: Option<Arc<RateLimiter>>,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Active lock duration; also the per-job deadline
    pub lock_duration: Duration,
    pub stalled_check_interval: Duration,
}

impl Default for QueueWorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(300),
            stalled_check_interval: Duration::from_secs(30),
        }
    }
}

/// Pool of consumer loops over a shared queue store
pub struct WorkerPool {
    queue: Arc<dyn Queue>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            running: Arc::new(AtomicBool::new(true)),
            active: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }

    /// Register a job handler. Later registrations win on conflict.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of jobs currently being processed
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Start the consumer, promoter, and stalled-recovery loops for a queue
    pub fn start(&mut self, queue_name: &'static str, opts: QueueWorkerOptions) {
        info!(
            queue = queue_name,
            concurrency = opts.concurrency,
            "Starting queue worker"
        );

        self.tasks.push(tokio::spawn(promoter_loop(
            self.queue.clone(),
            queue_name,
            self.running.clone(),
        )));

        self.tasks.push(tokio::spawn(stalled_loop(
            self.queue.clone(),
            queue_name,
            self.handlers.clone(),
            self.running.clone(),
            opts.stalled_check_interval,
        )));

        self.tasks.push(tokio::spawn(consumer_loop(
            self.queue.clone(),
            queue_name,
            self.handlers.clone(),
            self.running.clone(),
            self.active.clone(),
            opts,
        )));
    }

    /// Stop intake and wait for in-flight jobs, bounded by `drain_timeout`
    pub async fn close(&mut self, drain_timeout: Duration) {
        info!("Worker pool shutting down");
        self.running.store(false, Ordering::SeqCst);

        let start = tokio::time::Instant::now();
        loop {
            let active = self.active_jobs();
            if active == 0 {
                break;
            }
            if start.elapsed() > drain_timeout {
                warn!(active, "Drain timeout reached with jobs still active");
                break;
            }
            debug!(active, "Waiting for in-flight jobs");
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Worker pool stopped");
    }
}

async fn promoter_loop(queue: Arc<dyn Queue>, queue_name: &'static str, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        if let Err(e) = queue.promote_due(queue_name).await {
            warn!(queue = queue_name, error = %e, "Delayed-job promotion failed");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn stalled_loop(
    queue: Arc<dyn Queue>,
    queue_name: &'static str,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;
        match queue.recover_stalled(queue_name).await {
            Ok(stalled) => {
                for job in stalled {
                    if let Some(handler) = handlers.get(job.job_type.as_str()) {
                        if let Err(e) = handler.on_stalled(&job).await {
                            error!(job_id = %job.job_id, error = %e, "Stalled-job hook failed");
                        }
                    }
                }
            }
            Err(e) => warn!(queue = queue_name, error = %e, "Stalled recovery failed"),
        }
    }
}

async fn consumer_loop(
    queue: Arc<dyn Queue>,
    queue_name: &'static str,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    opts: QueueWorkerOptions,
) {
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));

    while running.load(Ordering::SeqCst) {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        if let Some(limiter) = &opts.rate_limit {
            limiter.acquire().await;
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        match queue.claim(queue_name, opts.lock_duration).await {
            Ok(Some(job)) => {
                let queue = queue.clone();
                let handlers = handlers.clone();
                let active = active.clone();
                let lock = opts.lock_duration;

                active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    process_job(queue, queue_name, &handlers, job, lock).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                });
            }
            Ok(None) => {
                drop(permit);
                tokio::time::sleep(opts.poll_interval).await;
            }
            Err(e) => {
                drop(permit);
                warn!(queue = queue_name, error = %e, "Claim failed");
                tokio::time::sleep(opts.poll_interval).await;
            }
        }
    }
}

async fn process_job(
    queue: Arc<dyn Queue>,
    queue_name: &'static str,
    handlers: &HashMap<&'static str, Arc<dyn JobHandler>>,
    job: Job,
    lock: Duration,
) {
    let Some(handler) = handlers.get(job.job_type.as_str()) else {
        error!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
        let _ = queue
            .fail(queue_name, &job.id, "no handler registered for job type")
            .await;
        return;
    };

    debug!(job_id = %job.id, attempt = job.attempts, "Processing job");

    // Keep the active lock alive while the handler runs.
    let heartbeat = {
        let queue = queue.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lock / 2);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = queue.heartbeat(queue_name, &job_id, lock).await {
                    warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                }
            }
        })
    };

    let outcome = tokio::time::timeout(lock, handler.handle(&job)).await;
    heartbeat.abort();

    match outcome {
        Ok(Ok(())) => {
            if let Err(e) = queue.complete(queue_name, &job.id).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job completed");
            }
        }
        Ok(Err(err)) if err.is_retryable() => {
            match queue.retry_or_fail(queue_name, &job.id, &err.to_string()).await {
                Ok(RetryOutcome::Retried { delay_ms }) => {
                    debug!(job_id = %job.id, delay_ms, "Job scheduled for retry");
                }
                Ok(RetryOutcome::Failed) => {
                    warn!(job_id = %job.id, "Job exhausted its attempts");
                }
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to report job error"),
            }
        }
        Ok(Err(err)) => {
            if let Err(e) = queue.fail(queue_name, &job.id, &err.to_string()).await {
                error!(job_id = %job.id, error = %e, "Failed to mark job failed");
            }
        }
        Err(_) => {
            let msg = format!("job exceeded its {}ms deadline", lock.as_millis());
            if let Err(e) = queue.retry_or_fail(queue_name, &job.id, &msg).await {
                error!(job_id = %job.id, error = %e, "Failed to report job timeout");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_allows_burst_up_to_max() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_defers_over_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        // Third slot only frees when the first stamp leaves the window.
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_rolls_forward() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.acquire().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
