//! Redis-backed durable job queue.
//!
//! Layout per logical queue, under `{prefix}:{queue}:`:
//! `job:{id}` hash with payload and bookkeeping, `delayed` ZSET scored by
//! due time, `waiting` LIST, `active` ZSET scored by lock expiry, and
//! `completed` / `failed` ZSETs trimmed by the removal policy.
//!
//! Multi-key transitions run as Lua scripts so each job id is delivered at
//! most once even with several worker processes on the same store.

use crate::job::{Job, JobState};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use redis::Script;
use std::time::Duration;
use threadline_core::error::{Error, Result};

/// Queue tuning knobs
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Completed jobs retained per queue
    pub keep_completed: usize,
    /// Failed jobs retained per queue
    pub keep_failed: usize,
    /// A job whose active lock expired this many times is failed outright
    pub max_stalled_count: u32,
    /// Delayed jobs promoted per sweep
    pub promote_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 1_000,
            max_stalled_count: 2,
            promote_batch: 100,
        }
    }
}

/// Result of an idempotent enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The job id already exists; treated as success by callers
    Duplicate,
}

/// Result of a removal attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The job is being processed and will self-consume
    Active,
    NotFound,
}

/// Result of a failure report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-delivered after the given backoff
    Retried { delay_ms: u64 },
    Failed,
}

/// A job reclaimed by stalled-lock recovery
#[derive(Debug, Clone)]
pub struct StalledJob {
    pub job_id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// True when the stall budget is exhausted and the job was failed
    pub failed: bool,
}

/// Per-state queue depths, for health reporting
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDepth {
    pub delayed: u64,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable queue operations
#[async_trait]
pub trait Queue: Send + Sync {
    /// Idempotent enqueue by the job's caller-supplied id
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome>;

    /// Best-effort removal; an active job is reported, not removed
    async fn remove(&self, queue: &str, job_id: &str) -> Result<RemoveOutcome>;

    /// Current state of a job, if known to the store
    async fn job_state(&self, queue: &str, job_id: &str) -> Result<Option<JobState>>;

    /// Move due delayed jobs into the waiting list
    async fn promote_due(&self, queue: &str) -> Result<u64>;

    /// Claim one waiting job, holding its lock for `lock` from now
    async fn claim(&self, queue: &str, lock: Duration) -> Result<Option<Job>>;

    /// Extend the active lock of a running job
    async fn heartbeat(&self, queue: &str, job_id: &str, lock: Duration) -> Result<()>;

    /// Terminal success
    async fn complete(&self, queue: &str, job_id: &str) -> Result<()>;

    /// Report a failure; the job is re-delayed with exponential backoff
    /// until its attempt budget is spent
    async fn retry_or_fail(&self, queue: &str, job_id: &str, error: &str) -> Result<RetryOutcome>;

    /// Terminal failure regardless of remaining attempts
    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<()>;

    /// Reclaim active jobs whose locks expired
    async fn recover_stalled(&self, queue: &str) -> Result<Vec<StalledJob>>;

    /// Depth snapshot
    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}

static ENQUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 1 then
          return 0
        end
        local state = 'waiting'
        if tonumber(ARGV[5]) > tonumber(ARGV[6]) then
          state = 'delayed'
        end
        redis.call('HSET', KEYS[1],
          'payload', ARGV[1], 'job_type', ARGV[2], 'state', state,
          'attempts', 0, 'max_attempts', ARGV[3], 'backoff_base_ms', ARGV[4],
          'stalled_count', 0, 'available_at_ms', ARGV[5], 'created_at_ms', ARGV[6],
          'last_error', '')
        if state == 'delayed' then
          redis.call('ZADD', KEYS[2], tonumber(ARGV[5]), ARGV[7])
        else
          redis.call('RPUSH', KEYS[3], ARGV[7])
        end
        return 1
        "#,
    )
});

static PROMOTE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[3]))
        for _, id in ipairs(due) do
          redis.call('ZREM', KEYS[1], id)
          redis.call('RPUSH', KEYS[2], id)
          redis.call('HSET', ARGV[2] .. id, 'state', 'waiting')
        end
        return #due
        "#,
    )
});

static CLAIM: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local id = redis.call('LPOP', KEYS[1])
        if not id then
          return nil
        end
        local key = ARGV[3] .. id
        local attempts = redis.call('HINCRBY', key, 'attempts', 1)
        redis.call('HSET', key, 'state', 'active')
        redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), id)
        local f = redis.call('HMGET', key, 'payload', 'job_type', 'max_attempts', 'backoff_base_ms', 'available_at_ms', 'created_at_ms')
        return {id, f[1], f[2], attempts, f[3], f[4], f[5], f[6]}
        "#,
    )
});

static COMPLETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        redis.call('ZREM', KEYS[1], ARGV[1])
        local key = ARGV[4] .. ARGV[1]
        redis.call('HSET', key, 'state', 'completed', 'finished_at_ms', ARGV[2])
        redis.call('ZADD', KEYS[2], tonumber(ARGV[2]), ARGV[1])
        local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[3])
        if excess > 0 then
          local old = redis.call('ZRANGE', KEYS[2], 0, excess - 1)
          for _, oid in ipairs(old) do
            redis.call('DEL', ARGV[4] .. oid)
          end
          redis.call('ZREMRANGEBYRANK', KEYS[2], 0, excess - 1)
        end
        return 1
        "#,
    )
});

static RETRY_OR_FAIL: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local key = ARGV[5] .. ARGV[1]
        redis.call('ZREM', KEYS[1], ARGV[1])
        local attempts = tonumber(redis.call('HGET', key, 'attempts') or '0')
        local max = tonumber(redis.call('HGET', key, 'max_attempts') or '1')
        redis.call('HSET', key, 'last_error', ARGV[3])
        if ARGV[6] == '0' and attempts < max then
          local base = tonumber(redis.call('HGET', key, 'backoff_base_ms') or '2000')
          local delay = base * 2 ^ (attempts - 1)
          redis.call('HSET', key, 'state', 'delayed')
          redis.call('ZADD', KEYS[2], tonumber(ARGV[2]) + delay, ARGV[1])
          return {1, delay}
        end
        redis.call('HSET', key, 'state', 'failed', 'finished_at_ms', ARGV[2])
        redis.call('ZADD', KEYS[3], tonumber(ARGV[2]), ARGV[1])
        local excess = redis.call('ZCARD', KEYS[3]) - tonumber(ARGV[4])
        if excess > 0 then
          local old = redis.call('ZRANGE', KEYS[3], 0, excess - 1)
          for _, oid in ipairs(old) do
            redis.call('DEL', ARGV[5] .. oid)
          end
          redis.call('ZREMRANGEBYRANK', KEYS[3], 0, excess - 1)
        end
        return {0, 0}
        "#,
    )
});

static RECOVER_STALLED: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
        local out = {}
        for _, id in ipairs(expired) do
          redis.call('ZREM', KEYS[1], id)
          local key = ARGV[4] .. id
          local stalled = redis.call('HINCRBY', key, 'stalled_count', 1)
          if stalled > tonumber(ARGV[2]) then
            redis.call('HSET', key, 'state', 'failed',
              'last_error', 'job stalled too many times', 'finished_at_ms', ARGV[1])
            redis.call('ZADD', KEYS[3], tonumber(ARGV[1]), id)
            table.insert(out, id)
            table.insert(out, 'failed')
          else
            -- stall retries spend the stalled budget, not the attempt budget
            redis.call('HINCRBY', key, 'attempts', -1)
            redis.call('HSET', key, 'state', 'waiting')
            redis.call('RPUSH', KEYS[2], id)
            table.insert(out, id)
            table.insert(out, 'waiting')
          end
        end
        return out
        "#,
    )
});

static REMOVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('ZSCORE', KEYS[3], ARGV[1]) then
          return -1
        end
        local removed = 0
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then removed = 1 end
        if redis.call('LREM', KEYS[2], 0, ARGV[1]) > 0 then removed = 1 end
        if removed == 1 then
          redis.call('DEL', ARGV[2] .. ARGV[1])
        end
        return removed
        "#,
    )
});

/// Redis-backed implementation of [`Queue`]
pub struct JobQueue {
    pool: deadpool_redis::Pool,
    prefix: String,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(pool: deadpool_redis::Pool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            config: QueueConfig::default(),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::queue(format!("Failed to get Redis connection: {}", e)))
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, suffix)
    }

    fn job_key_base(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }
}

#[async_trait]
impl Queue for JobQueue {
    async fn enqueue(&self, job: Job) -> Result<EnqueueOutcome> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| Error::serialization(format!("Failed to encode job payload: {}", e)))?;

        let created: i64 = ENQUEUE
            .key(format!("{}{}", self.job_key_base(&job.queue), job.id))
            .key(self.key(&job.queue, "delayed"))
            .key(self.key(&job.queue, "waiting"))
            .arg(payload)
            .arg(&job.job_type)
            .arg(job.max_attempts)
            .arg(job.backoff_base_ms)
            .arg(job.available_at.timestamp_millis())
            .arg(Utc::now().timestamp_millis())
            .arg(&job.id)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Enqueue failed", e))?;

        if created == 1 {
            tracing::debug!(job_id = %job.id, queue = %job.queue, "Job enqueued");
            Ok(EnqueueOutcome::Enqueued)
        } else {
            tracing::debug!(job_id = %job.id, queue = %job.queue, "Duplicate job id, skipped");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    async fn remove(&self, queue: &str, job_id: &str) -> Result<RemoveOutcome> {
        let mut conn = self.conn().await?;
        let outcome: i64 = REMOVE
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "active"))
            .arg(job_id)
            .arg(self.job_key_base(queue))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Remove failed", e))?;

        Ok(match outcome {
            -1 => RemoveOutcome::Active,
            1 => RemoveOutcome::Removed,
            _ => RemoveOutcome::NotFound,
        })
    }

    async fn job_state(&self, queue: &str, job_id: &str) -> Result<Option<JobState>> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let state: Option<String> = conn
            .hget(format!("{}{}", self.job_key_base(queue), job_id), "state")
            .await
            .map_err(|e| Error::queue_with_source("State lookup failed", e))?;
        Ok(state.as_deref().and_then(JobState::parse))
    }

    async fn promote_due(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let promoted: u64 = PROMOTE
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "waiting"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.job_key_base(queue))
            .arg(self.config.promote_batch)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Promotion failed", e))?;

        if promoted > 0 {
            tracing::debug!(queue = %queue, promoted, "Promoted due jobs");
        }
        Ok(promoted)
    }

    async fn claim(&self, queue: &str, lock: Duration) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        let row: Option<(String, String, String, u32, u32, u64, i64, i64)> = CLAIM
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "active"))
            .arg(Utc::now().timestamp_millis())
            .arg(lock.as_millis() as u64)
            .arg(self.job_key_base(queue))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Claim failed", e))?;

        let Some((id, payload, job_type, attempts, max_attempts, backoff, available_ms, created_ms)) =
            row
        else {
            return Ok(None);
        };

        let payload = serde_json::from_str(&payload)
            .map_err(|e| Error::serialization(format!("Corrupt job payload: {}", e)))?;

        Ok(Some(Job {
            id,
            queue: queue.to_string(),
            job_type,
            payload,
            attempts,
            max_attempts,
            backoff_base_ms: backoff,
            available_at: millis_to_utc(available_ms),
            created_at: millis_to_utc(created_ms),
        }))
    }

    async fn heartbeat(&self, queue: &str, job_id: &str, lock: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let expiry = Utc::now().timestamp_millis() + lock.as_millis() as i64;
        // XX: only refresh jobs that are still active
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key(queue, "active"))
            .arg("XX")
            .arg("CH")
            .arg(expiry)
            .arg(job_id)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Heartbeat failed", e))?;
        Ok(())
    }

    async fn complete(&self, queue: &str, job_id: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = COMPLETE
            .key(self.key(queue, "active"))
            .key(self.key(queue, "completed"))
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.keep_completed)
            .arg(self.job_key_base(queue))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Complete failed", e))?;

        tracing::debug!(job_id = %job_id, queue = %queue, "Job completed");
        Ok(())
    }

    async fn retry_or_fail(&self, queue: &str, job_id: &str, error: &str) -> Result<RetryOutcome> {
        let mut conn = self.conn().await?;
        let (retried, delay_ms): (i64, u64) = RETRY_OR_FAIL
            .key(self.key(queue, "active"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "failed"))
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .arg(error)
            .arg(self.config.keep_failed)
            .arg(self.job_key_base(queue))
            .arg("0")
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Retry dispatch failed", e))?;

        if retried == 1 {
            tracing::debug!(job_id = %job_id, queue = %queue, delay_ms, "Job re-delayed");
            Ok(RetryOutcome::Retried { delay_ms })
        } else {
            tracing::warn!(job_id = %job_id, queue = %queue, error = %error, "Job failed");
            Ok(RetryOutcome::Failed)
        }
    }

    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: (i64, u64) = RETRY_OR_FAIL
            .key(self.key(queue, "active"))
            .key(self.key(queue, "delayed"))
            .key(self.key(queue, "failed"))
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .arg(error)
            .arg(self.config.keep_failed)
            .arg(self.job_key_base(queue))
            .arg("1")
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Fail dispatch failed", e))?;

        tracing::warn!(job_id = %job_id, queue = %queue, error = %error, "Job failed permanently");
        Ok(())
    }

    async fn recover_stalled(&self, queue: &str) -> Result<Vec<StalledJob>> {
        let mut conn = self.conn().await?;
        let flat: Vec<String> = RECOVER_STALLED
            .key(self.key(queue, "active"))
            .key(self.key(queue, "waiting"))
            .key(self.key(queue, "failed"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.config.max_stalled_count)
            .arg(self.config.keep_failed)
            .arg(self.job_key_base(queue))
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::queue_with_source("Stalled recovery failed", e))?;

        let mut stalled = Vec::with_capacity(flat.len() / 2);
        for pair in flat.chunks(2) {
            let [job_id, disposition] = pair else { continue };
            let (job_type, payload): (Option<String>, Option<String>) = redis::cmd("HMGET")
                .arg(format!("{}{}", self.job_key_base(queue), job_id))
                .arg("job_type")
                .arg("payload")
                .query_async(&mut *conn)
                .await
                .map_err(|e| Error::queue_with_source("Stalled job lookup failed", e))?;

            stalled.push(StalledJob {
                job_id: job_id.clone(),
                job_type: job_type.unwrap_or_default(),
                payload: payload
                    .and_then(|p| serde_json::from_str(&p).ok())
                    .unwrap_or(serde_json::Value::Null),
                failed: disposition.as_str() == "failed",
            });
        }

        if !stalled.is_empty() {
            tracing::warn!(queue = %queue, count = stalled.len(), "Recovered stalled jobs");
        }
        Ok(stalled)
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;

        let delayed: u64 = conn
            .zcard(self.key(queue, "delayed"))
            .await
            .map_err(|e| Error::queue_with_source("Depth query failed", e))?;
        let waiting: u64 = conn
            .llen(self.key(queue, "waiting"))
            .await
            .map_err(|e| Error::queue_with_source("Depth query failed", e))?;
        let active: u64 = conn
            .zcard(self.key(queue, "active"))
            .await
            .map_err(|e| Error::queue_with_source("Depth query failed", e))?;
        let completed: u64 = conn
            .zcard(self.key(queue, "completed"))
            .await
            .map_err(|e| Error::queue_with_source("Depth query failed", e))?;
        let failed: u64 = conn
            .zcard(self.key(queue, "failed"))
            .await
            .map_err(|e| Error::queue_with_source("Depth query failed", e))?;

        Ok(QueueDepth {
            delayed,
            waiting,
            active,
            completed,
            failed,
        })
    }
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Open a Redis pool for the queue and scheduler state
pub fn connect(config: &threadline_core::config::RedisConfig) -> Result<deadpool_redis::Pool> {
    deadpool_redis::Config::from_url(&config.url)
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| Error::queue(format!("Failed to create Redis pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let queue = JobQueue::new(pool, "threadline");
        assert_eq!(queue.key("publish", "waiting"), "threadline:publish:waiting");
        assert_eq!(queue.job_key_base("publish"), "threadline:publish:job:");
    }

    #[test]
    fn test_default_removal_policy() {
        let config = QueueConfig::default();
        assert_eq!(config.keep_completed, 100);
        assert_eq!(config.keep_failed, 1_000);
        assert_eq!(config.max_stalled_count, 2);
    }
}
