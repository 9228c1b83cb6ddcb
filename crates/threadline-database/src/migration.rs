//! Database migration system.

use sqlx::PgPool;
use threadline_core::error::{Error, Result};

/// Migration entry
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Database migrator
pub struct Migrator {
    migrations: Vec<Migration>,
}

impl Migrator {
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }

    /// The full embedded migration set for the engine
    pub fn with_embedded() -> Self {
        Self::new().with_migrations(embedded_migrations())
    }

    /// Add a migration
    pub fn add(&mut self, migration: Migration) -> &mut Self {
        self.migrations.push(migration);
        self.migrations.sort_by_key(|m| m.version);
        self
    }

    pub fn with_migrations(mut self, migrations: Vec<Migration>) -> Self {
        for m in migrations {
            self.add(m);
        }
        self
    }

    /// Run all pending migrations
    pub async fn run(&self, pool: &PgPool) -> Result<Vec<i64>> {
        self.ensure_migrations_table(pool).await?;

        let applied = self.applied_versions(pool).await?;
        let mut newly_applied = Vec::new();

        for migration in &self.migrations {
            if !applied.contains(&migration.version) {
                self.apply(pool, migration).await?;
                newly_applied.push(migration.version);
            }
        }

        if newly_applied.is_empty() {
            tracing::info!("No pending migrations");
        } else {
            tracing::info!(count = newly_applied.len(), "Applied migrations");
        }

        Ok(newly_applied)
    }

    async fn ensure_migrations_table(&self, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| Error::database_with_source("Failed to create migrations table", e))?;
        Ok(())
    }

    async fn applied_versions(&self, pool: &PgPool) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT version FROM schema_migrations")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::database_with_source("Failed to read applied migrations", e))?;
        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    async fn apply(&self, pool: &PgPool, migration: &Migration) -> Result<()> {
        tracing::info!(version = migration.version, name = %migration.name, "Applying migration");

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::database_with_source("Failed to begin migration", e))?;

        sqlx::raw_sql(&migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                Error::database_with_source(
                    format!("Migration {} ({}) failed", migration.version, migration.name),
                    e,
                )
            })?;

        sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(&migration.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::database_with_source("Failed to record migration", e))?;

        tx.commit()
            .await
            .map_err(|e| Error::database_with_source("Failed to commit migration", e))?;

        Ok(())
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Embedded SQL migrations, applied in version order
pub fn embedded_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "create_posts",
            r#"
            CREATE TABLE posts (
                id UUID PRIMARY KEY,
                content TEXT NOT NULL,
                post_type TEXT NOT NULL DEFAULT 'text',
                image_urls JSONB NOT NULL DEFAULT '[]',
                video_url TEXT,
                comment TEXT,
                account_id UUID,
                status TEXT NOT NULL DEFAULT 'draft',
                scheduled_at TIMESTAMPTZ,
                schedule_config JSONB,
                published_at TIMESTAMPTZ,
                platform_post_id TEXT,
                platform_comment_id TEXT,
                comment_status TEXT NOT NULL DEFAULT 'none',
                comment_retry_count INTEGER NOT NULL DEFAULT 0,
                content_hash TEXT,
                publishing_progress JSONB,
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                lock_expires_at TIMESTAMPTZ,
                error TEXT,
                error_category TEXT,
                suggested_action TEXT,
                version BIGINT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE INDEX idx_posts_status ON posts (status);
            CREATE INDEX idx_posts_scheduled_at ON posts (scheduled_at)
                WHERE status = 'scheduled';
            CREATE INDEX idx_posts_content_hash ON posts (content_hash)
                WHERE content_hash IS NOT NULL;
            "#,
        ),
        Migration::new(
            2,
            "create_credentials",
            r#"
            CREATE TABLE credentials (
                id UUID PRIMARY KEY,
                platform_user_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                is_default BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );

            CREATE UNIQUE INDEX idx_credentials_single_default ON credentials (is_default)
                WHERE is_default;
            "#,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered_and_unique() {
        let migrations = embedded_migrations();
        let mut versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        let sorted = versions.clone();
        versions.dedup();
        assert_eq!(versions, sorted);
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_add_keeps_version_order() {
        let mut migrator = Migrator::new();
        migrator.add(Migration::new(2, "b", "SELECT 2"));
        migrator.add(Migration::new(1, "a", "SELECT 1"));
        assert_eq!(migrator.migrations[0].version, 1);
        assert_eq!(migrator.migrations[1].version, 2);
    }
}
