//! Off-process scheduler state.
//!
//! Three Redis keys survive restarts: the instant the current tick is armed
//! for, the id of the armed tick job, and a short-lived reconciliation
//! lock. The keys are only ever mutated while holding the lock.

use chrono::{DateTime, TimeZone, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::time::Duration;
use threadline_core::error::{Error, Result};
use uuid::Uuid;

const NEXT_EXECUTION_KEY: &str = "scheduler:nextExecutionAt";
const ACTIVE_JOB_KEY: &str = "scheduler:activeJobId";
const LOCK_KEY: &str = "scheduler:lock";

/// Token proving lock ownership; pass it back to `unlock`
pub struct LockToken(String);

/// Redis-backed scheduler state
#[derive(Clone)]
pub struct SchedulerState {
    pool: Pool,
    prefix: String,
}

impl SchedulerState {
    pub fn new(pool: Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::queue(format!("Failed to get Redis connection: {}", e)))
    }

    /// Epoch instant the current tick is armed for, if any
    pub async fn next_execution_at(&self) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.key(NEXT_EXECUTION_KEY))
            .await
            .map_err(|e| Error::queue_with_source("Failed to read nextExecutionAt", e))?;

        Ok(raw
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }

    /// Id of the armed tick job, if any
    pub async fn active_job_id(&self) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        conn.get(self.key(ACTIVE_JOB_KEY))
            .await
            .map_err(|e| Error::queue_with_source("Failed to read activeJobId", e))
    }

    /// Record the armed tick
    pub async fn set_armed(&self, at: DateTime<Utc>, job_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set(
                self.key(NEXT_EXECUTION_KEY),
                at.timestamp_millis().to_string(),
            )
            .await
            .map_err(|e| Error::queue_with_source("Failed to write nextExecutionAt", e))?;
        let _: () = conn
            .set(self.key(ACTIVE_JOB_KEY), job_id)
            .await
            .map_err(|e| Error::queue_with_source("Failed to write activeJobId", e))?;
        Ok(())
    }

    /// Drop both state keys
    pub async fn clear(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn
            .del(&[self.key(NEXT_EXECUTION_KEY), self.key(ACTIVE_JOB_KEY)])
            .await
            .map_err(|e| Error::queue_with_source("Failed to clear scheduler state", e))?;
        Ok(())
    }

    /// Acquire the reconciliation lock, retrying for up to `wait`.
    ///
    /// The lock value is a one-shot token so an expired holder cannot
    /// release a successor's lock.
    pub async fn lock(&self, ttl: Duration, wait: Duration) -> Result<LockToken> {
        let token = Uuid::new_v4().to_string();
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let mut conn = self.conn().await?;
            let acquired: Option<String> = redis::cmd("SET")
                .arg(self.key(LOCK_KEY))
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut *conn)
                .await
                .map_err(|e| Error::queue_with_source("Scheduler lock attempt failed", e))?;

            if acquired.is_some() {
                return Ok(LockToken(token));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::SchedulerLockHeld);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Release the reconciliation lock if we still own it
    pub async fn unlock(&self, token: LockToken) -> Result<()> {
        let mut conn = self.conn().await?;
        let script = redis::Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
              return redis.call('DEL', KEYS[1])
            end
            return 0
            "#,
        );
        let _: i64 = script
            .key(self.key(LOCK_KEY))
            .arg(token.0)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Scheduler unlock failed", e))?;
        Ok(())
    }
}
