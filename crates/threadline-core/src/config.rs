//! Configuration for the Threadline engine.
//!
//! Every knob has a serde-deserializable struct with a `Default` that
//! matches production values, plus an environment overlay recognising the
//! deployment variables.

use crate::error::{Error, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable names recognised by the engine
pub mod env_vars {
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const REDIS_URL: &str = "REDIS_URL";
    pub const USE_EVENT_DRIVEN_SCHEDULER: &str = "USE_EVENT_DRIVEN_SCHEDULER";
    pub const SCHEDULER_BATCH_WINDOW_MS: &str = "SCHEDULER_BATCH_WINDOW_MS";
    pub const WORKER_CONCURRENCY: &str = "WORKER_CONCURRENCY";
    pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";
    pub const DUPLICATION_WINDOW_HOURS: &str = "DUPLICATION_WINDOW_HOURS";
    pub const EXECUTION_LOCK_TIMEOUT_MS: &str = "EXECUTION_LOCK_TIMEOUT_MS";
    pub const COMMENT_MAX_RETRIES: &str = "COMMENT_MAX_RETRIES";
    pub const THREADS_API_VERSION: &str = "THREADS_API_VERSION";
    pub const TZ: &str = "TZ";
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Redis configuration (queue + scheduler state)
    pub redis: RedisConfig,
    /// Event-driven scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Worker pool configuration
    pub worker: WorkerConfig,
    /// Publish pipeline configuration
    pub publisher: PublisherConfig,
    /// Threads platform configuration
    pub platform: PlatformConfig,
}

impl AppConfig {
    /// Build configuration from defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = env::var(env_vars::DATABASE_URL) {
            config.database.url = url;
        }
        if let Ok(url) = env::var(env_vars::REDIS_URL) {
            config.redis.url = url;
        }
        if let Some(v) = parse_env::<bool>(env_vars::USE_EVENT_DRIVEN_SCHEDULER)? {
            config.scheduler.event_driven = v;
        }
        if let Some(v) = parse_env::<u64>(env_vars::SCHEDULER_BATCH_WINDOW_MS)? {
            config.scheduler.batch_window_ms = v;
        }
        if let Some(v) = parse_env::<usize>(env_vars::WORKER_CONCURRENCY)? {
            config.worker.publish_concurrency = v;
        }
        if let Some(v) = parse_env::<u64>(env_vars::JOB_TIMEOUT)? {
            config.worker.job_timeout_ms = v;
        }
        if let Some(v) = parse_env::<u64>(env_vars::DUPLICATION_WINDOW_HOURS)? {
            config.publisher.duplication_window_hours = v;
        }
        if let Some(v) = parse_env::<u64>(env_vars::EXECUTION_LOCK_TIMEOUT_MS)? {
            config.publisher.execution_lock_timeout_ms = v;
        }
        if let Some(v) = parse_env::<u32>(env_vars::COMMENT_MAX_RETRIES)? {
            config.publisher.comment_max_retries = v;
        }
        if let Ok(v) = env::var(env_vars::THREADS_API_VERSION) {
            config.platform.api_version = v;
        }
        if let Ok(tz) = env::var(env_vars::TZ) {
            Tz::from_str(&tz).map_err(|_| {
                Error::configuration(format!("Unknown time zone in TZ: {}", tz))
            })?;
            config.scheduler.timezone = tz;
        }

        Ok(config)
    }
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::configuration(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
    /// Maximum connection pool size
    pub pool_max: u32,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/threadline".to_string(),
            pool_max: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL
    pub url: String,
    /// Key prefix shared by the queues and scheduler state
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "threadline".to_string(),
        }
    }
}

/// Event-driven scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Use the event-driven tick path; false falls back to 60s polling
    pub event_driven: bool,
    /// Batch window W in milliseconds: posts due within `now + W` are
    /// swept onto the publish queue together
    pub batch_window_ms: u64,
    /// Scheduler reconciliation lock TTL in milliseconds
    pub lock_ttl_ms: u64,
    /// How long to keep retrying lock acquisition in milliseconds
    pub lock_wait_ms: u64,
    /// Interval of the consistency validator in seconds
    pub validator_interval_secs: u64,
    /// Polling interval of the legacy fallback in seconds
    pub polling_interval_secs: u64,
    /// IANA time zone used to interpret recurrence times and days
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_driven: true,
            batch_window_ms: 5_000,
            lock_ttl_ms: 10_000,
            lock_wait_ms: 5_000,
            validator_interval_secs: 60,
            polling_interval_secs: 60,
            timezone: "Asia/Ho_Chi_Minh".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn batch_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.batch_window_ms as i64)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Parsed time zone. Falls back to UTC when the configured name is
    /// unknown (the env overlay rejects unknown names up front).
    pub fn tz(&self) -> Tz {
        Tz::from_str(&self.timezone).unwrap_or(chrono_tz::UTC)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Publish queue concurrency
    pub publish_concurrency: usize,
    /// Job lock duration / per-job deadline in milliseconds
    pub job_timeout_ms: u64,
    /// Stalled-job detection interval in seconds
    pub stalled_check_interval_secs: u64,
    /// Times a job may stall before it is failed outright
    pub max_stalled_count: u32,
    /// Requests allowed per rate window on the publish queue
    pub rate_limit_max: u32,
    /// Rolling rate window in seconds
    pub rate_limit_window_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            publish_concurrency: 5,
            job_timeout_ms: 300_000,
            stalled_check_interval_secs: 30,
            max_stalled_count: 2,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
        }
    }
}

impl WorkerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

/// Publish pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Duplicate-content lookback window in hours
    pub duplication_window_hours: u64,
    /// Execution lock TTL in milliseconds
    pub execution_lock_timeout_ms: u64,
    /// Maximum comment-only retry attempts
    pub comment_max_retries: u32,
    /// Base delay between comment retries in seconds (scaled by attempt)
    pub comment_retry_base_secs: u64,
    /// Posts stuck in PUBLISHING longer than this are swept (minutes)
    pub stuck_threshold_mins: i64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            duplication_window_hours: 24,
            execution_lock_timeout_ms: 300_000,
            comment_max_retries: 3,
            comment_retry_base_secs: 60,
            stuck_threshold_mins: 5,
        }
    }
}

impl PublisherConfig {
    pub fn duplication_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.duplication_window_hours as i64)
    }

    pub fn execution_lock_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.execution_lock_timeout_ms as i64)
    }
}

/// Threads platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Graph API base URL
    pub base_url: String,
    /// Graph API version segment
    pub api_version: String,
    /// Default HTTP timeout in seconds
    pub request_timeout_secs: u64,
    /// Media HEAD validation timeout in seconds
    pub media_check_timeout_secs: u64,
    /// Container readiness poll interval in seconds
    pub poll_interval_secs: u64,
    /// Container readiness ceiling in seconds
    pub poll_ceiling_secs: u64,
    /// Pause before posting the reply comment in seconds
    pub comment_delay_secs: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "https://graph.threads.net".to_string(),
            api_version: "v1.0".to_string(),
            request_timeout_secs: 60,
            media_check_timeout_secs: 5,
            poll_interval_secs: 5,
            poll_ceiling_secs: 300,
            comment_delay_secs: 30,
        }
    }
}

impl PlatformConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn api_root(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.api_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_values() {
        let config = AppConfig::default();
        assert_eq!(config.scheduler.batch_window_ms, 5_000);
        assert_eq!(config.worker.publish_concurrency, 5);
        assert_eq!(config.worker.job_timeout_ms, 300_000);
        assert_eq!(config.publisher.duplication_window_hours, 24);
        assert_eq!(config.publisher.comment_max_retries, 3);
        assert_eq!(config.scheduler.timezone, "Asia/Ho_Chi_Minh");
    }

    #[test]
    fn test_timezone_parses() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tz(), chrono_tz::Asia::Ho_Chi_Minh);
    }

    #[test]
    fn test_api_root() {
        let config = PlatformConfig::default();
        assert_eq!(config.api_root(), "https://graph.threads.net/v1.0");
    }

    #[test]
    fn test_env_overlay() {
        // Env mutation is process-global; keep every env-dependent
        // assertion in this single test.
        env::set_var(env_vars::WORKER_CONCURRENCY, "8");
        env::set_var(env_vars::SCHEDULER_BATCH_WINDOW_MS, "2500");
        env::set_var(env_vars::USE_EVENT_DRIVEN_SCHEDULER, "false");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.worker.publish_concurrency, 8);
        assert_eq!(config.scheduler.batch_window_ms, 2_500);
        assert!(!config.scheduler.event_driven);
        env::remove_var(env_vars::WORKER_CONCURRENCY);
        env::remove_var(env_vars::SCHEDULER_BATCH_WINDOW_MS);
        env::remove_var(env_vars::USE_EVENT_DRIVEN_SCHEDULER);

        env::set_var(env_vars::WORKER_CONCURRENCY, "not-a-number");
        assert!(AppConfig::from_env().is_err());
        env::remove_var(env_vars::WORKER_CONCURRENCY);
    }
}
