//! Job handlers binding the queue runtime to the pipeline and scheduler.

use crate::pipeline::PublishPipeline;
use crate::recovery::RecoveryService;
use async_trait::async_trait;
use std::sync::Arc;
use threadline_core::error::Result;
use threadline_queue::{Job, JobHandler, JobPayload, PublishJob, SchedulerTickJob, StalledJob};
use threadline_scheduler::EventScheduler;
use tracing::{info, warn};

/// Handler for `publish` jobs
pub struct PublishJobHandler {
    pipeline: Arc<PublishPipeline>,
    recovery: Arc<RecoveryService>,
}

impl PublishJobHandler {
    pub fn new(pipeline: Arc<PublishPipeline>, recovery: Arc<RecoveryService>) -> Self {
        Self { pipeline, recovery }
    }
}

#[async_trait]
impl JobHandler for PublishJobHandler {
    fn job_type(&self) -> &'static str {
        <PublishJob as JobPayload>::job_type()
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        self.pipeline.process(job).await
    }

    async fn on_stalled(&self, stalled: &StalledJob) -> Result<()> {
        let Ok(payload) = serde_json::from_value::<PublishJob>(stalled.payload.clone()) else {
            warn!(job_id = %stalled.job_id, "Stalled job payload unreadable");
            return Ok(());
        };
        // A stalled comment retry leaves the published post intact.
        if payload.comment_only_retry {
            return Ok(());
        }
        let outcome = self.recovery.recover_post(payload.post_id).await?;
        info!(post_id = %payload.post_id, outcome = ?outcome, "Stalled publish job recovered");
        Ok(())
    }
}

/// Handler for `scheduler-tick` jobs
pub struct SchedulerTickHandler {
    scheduler: Arc<EventScheduler>,
}

impl SchedulerTickHandler {
    pub fn new(scheduler: Arc<EventScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl JobHandler for SchedulerTickHandler {
    fn job_type(&self) -> &'static str {
        <SchedulerTickJob as JobPayload>::job_type()
    }

    async fn handle(&self, job: &Job) -> Result<()> {
        let payload: SchedulerTickJob = job.decode()?;
        let dispatched = self.scheduler.process_due_tick().await?;
        info!(
            check_time = %payload.check_time,
            dispatched,
            "Scheduler tick processed"
        );
        Ok(())
    }
}
