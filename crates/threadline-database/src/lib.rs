//! # Threadline Database
//!
//! Post store for the publishing engine: domain models, Postgres
//! repositories with optimistic concurrency, and embedded migrations.

pub mod migration;
pub mod models;
pub mod repository;

pub use migration::{embedded_migrations, Migration, Migrator};
pub use models::{
    CommentStatus, Credential, ExecutionLock, Post, PostStatus, PostType, ProgressStatus,
    PublishingProgress, ScheduleConfig, SchedulePattern,
};
pub use repository::{CredentialRepository, PostRepository};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use threadline_core::config::DatabaseConfig;
use threadline_core::error::{Error, Result};

/// Open a connection pool against the configured database
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.pool_max)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.url)
        .await
        .map_err(|e| Error::database_with_source("Failed to connect to Postgres", e))
}
