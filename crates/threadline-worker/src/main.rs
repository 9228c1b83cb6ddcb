//! Threadline worker entry point.
//!
//! Boots the publishing engine: config, stores, queue workers, the
//! event-driven scheduler (or the polling fallback), the periodic
//! validator, and graceful shutdown on SIGTERM/SIGINT.

mod shutdown;
mod state;

use clap::Parser;
use shutdown::{listen_for_shutdown_signals, ShutdownController};
use state::EngineState;
use std::sync::Arc;
use std::time::Duration;
use threadline_core::config::AppConfig;
use threadline_publisher::{PublishJobHandler, SchedulerTickHandler};
use threadline_queue::{
    QueueWorkerOptions, RateLimiter, WorkerPool, PUBLISH_QUEUE, SCHEDULER_TICK_QUEUE,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Threadline publishing worker
#[derive(Parser, Debug)]
#[command(name = "threadline-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run migrations and exit
    #[arg(long)]
    migrate_only: bool,

    /// Run the stuck-post sweep and exit
    #[arg(long)]
    sweep_stuck: bool,

    /// Repair one post stuck in publishing, then exit
    #[arg(long, value_name = "POST_ID")]
    fix_stuck: Option<uuid::Uuid>,

    /// Arm an immediate scheduler check before starting
    #[arg(long)]
    check_now: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "threadline=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    let state = EngineState::build(config).await?;

    if cli.migrate_only {
        info!("Migrations applied, exiting");
        return Ok(());
    }
    if cli.sweep_stuck {
        let repaired = state.recovery.sweep_stuck().await?;
        info!(repaired, "Stuck-post sweep finished, exiting");
        return Ok(());
    }
    if let Some(post_id) = cli.fix_stuck {
        let outcome = state.commands.fix_stuck(post_id).await?;
        info!(post_id = %post_id, outcome = ?outcome, "Stuck post repaired, exiting");
        return Ok(());
    }
    if cli.check_now {
        state.scheduler.schedule_immediate_check().await?;
        info!("Immediate scheduler check armed");
    }

    let controller = ShutdownController::new();
    tokio::spawn(listen_for_shutdown_signals(controller.clone()));

    if let Err(e) = run(state, controller.clone()).await {
        // Failures drain through the same shutdown path as signals.
        error!(error = %e, "Worker error");
        controller.shutdown();
        return Err(e);
    }
    Ok(())
}

async fn run(state: EngineState, controller: ShutdownController) -> anyhow::Result<()> {
    // Repair anything a previous process left behind before taking work.
    state.scheduler.initialize().await?;
    let repaired = state.recovery.sweep_stuck().await?;
    if repaired > 0 {
        warn!(repaired, "Startup sweep repaired stranded posts");
    }

    let worker_config = &state.config.worker;
    let mut pool = WorkerPool::new(state.queue.clone());
    pool.register(Arc::new(PublishJobHandler::new(
        state.pipeline.clone(),
        state.recovery.clone(),
    )));
    pool.register(Arc::new(SchedulerTickHandler::new(state.scheduler.clone())));

    pool.start(
        PUBLISH_QUEUE,
        QueueWorkerOptions {
            concurrency: worker_config.publish_concurrency,
            rate_limit: Some(Arc::new(RateLimiter::new(
                worker_config.rate_limit_max as usize,
                worker_config.rate_limit_window(),
            ))),
            lock_duration: worker_config.job_timeout(),
            stalled_check_interval: Duration::from_secs(
                worker_config.stalled_check_interval_secs,
            ),
            ..Default::default()
        },
    );
    pool.start(
        SCHEDULER_TICK_QUEUE,
        QueueWorkerOptions {
            concurrency: 1,
            lock_duration: worker_config.job_timeout(),
            stalled_check_interval: Duration::from_secs(
                worker_config.stalled_check_interval_secs,
            ),
            ..Default::default()
        },
    );

    if state.config.scheduler.event_driven {
        spawn_validator(&state, &controller);
        info!("Event-driven scheduler active");
    } else {
        spawn_polling_fallback(&state, &controller);
        info!("Legacy polling scheduler active");
    }

    info!("Threadline worker running");
    let mut signal = controller.subscribe();
    let _ = signal.recv().await;

    pool.close(worker_config.job_timeout()).await;
    state.pool.close().await;
    info!("Worker exited cleanly");
    Ok(())
}

/// Periodic scheduler-state consistency check
fn spawn_validator(state: &EngineState, controller: &ShutdownController) {
    let scheduler = state.scheduler.clone();
    let interval = Duration::from_secs(state.config.scheduler.validator_interval_secs);
    let mut signal = controller.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = scheduler.validate().await {
                        warn!(error = %e, "Scheduler validation failed");
                    }
                }
                _ = signal.recv() => break,
            }
        }
    });
}

/// 60-second polling loop used when the event-driven path is disabled
fn spawn_polling_fallback(state: &EngineState, controller: &ShutdownController) {
    let scheduler = state.scheduler.clone();
    let interval = Duration::from_secs(state.config.scheduler.polling_interval_secs);
    let mut signal = controller.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match scheduler.poll_once().await {
                        Ok(dispatched) if dispatched > 0 => {
                            info!(dispatched, "Polling sweep dispatched due posts");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Polling sweep failed"),
                    }
                }
                _ = signal.recv() => break,
            }
        }
    });
}
