//! Engine assembly: connections, repositories, and services.

use std::sync::Arc;
use threadline_core::config::AppConfig;
use threadline_core::error::Result;
use threadline_database::{CredentialRepository, Migrator, PostRepository};
use threadline_platform::{AdapterRegistry, ThreadsAdapter};
use threadline_publisher::{PostCommands, PublishPipeline, RecoveryService};
use threadline_queue::{JobQueue, Queue};
use threadline_scheduler::{EventScheduler, SchedulerState};
use tracing::info;

/// Everything a worker process holds
pub struct EngineState {
    pub config: AppConfig,
    pub pool: sqlx::PgPool,
    pub queue: Arc<dyn Queue>,
    pub scheduler: Arc<EventScheduler>,
    pub pipeline: Arc<PublishPipeline>,
    pub recovery: Arc<RecoveryService>,
    pub commands: Arc<PostCommands>,
}

impl EngineState {
    /// Connect to Postgres and Redis, run migrations, and assemble services
    pub async fn build(config: AppConfig) -> Result<Self> {
        let pool = threadline_database::connect(&config.database).await?;
        info!("Connected to Postgres");

        Migrator::with_embedded().run(&pool).await?;

        let redis = threadline_queue::connect(&config.redis)?;
        info!("Connected to Redis");

        let posts = PostRepository::new(pool.clone());
        let credentials = CredentialRepository::new(pool.clone());

        let queue: Arc<dyn Queue> =
            Arc::new(JobQueue::new(redis.clone(), config.redis.key_prefix.clone()));

        let scheduler_state = SchedulerState::new(redis, config.redis.key_prefix.clone());
        let scheduler = Arc::new(EventScheduler::new(
            scheduler_state,
            queue.clone(),
            posts.clone(),
            config.scheduler.clone(),
        ));

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(ThreadsAdapter::new(config.platform.clone())?));
        let adapters = Arc::new(adapters);

        let recovery = Arc::new(RecoveryService::new(posts.clone(), config.publisher.clone()));
        let pipeline = Arc::new(PublishPipeline::new(
            posts.clone(),
            credentials,
            queue.clone(),
            scheduler.clone(),
            adapters,
            config.publisher.clone(),
            config.worker.clone(),
            config.scheduler.tz(),
        ));
        let commands = Arc::new(PostCommands::new(
            posts.clone(),
            queue.clone(),
            scheduler.clone(),
            recovery.clone(),
        ));

        Ok(Self {
            config,
            pool,
            queue,
            scheduler,
            pipeline,
            recovery,
            commands,
        })
    }
}
