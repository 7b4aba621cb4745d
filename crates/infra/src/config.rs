//! Configuration loading and representation.
//!
//! Every setting has a default and can be overridden from `CONVEYOR_*`
//! environment variables. Durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::jobs::retry::BackoffStrategy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Typed reads from a key/value source (the process environment in production).
struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value,
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value,
                    reason: "expected a boolean".to_string(),
                }),
            },
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Settings of one async executor instance.
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncExecutorConfig {
    /// Whether the node starts its executor at all.
    pub activate: bool,
    /// Prefix of the generated executor id (the lock owner written to claimed jobs).
    pub executor_name: String,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    /// Idle time after which threads above the core size exit.
    pub keep_alive: Duration,
    /// Bounded worker queue; a full queue shrinks the next acquisition batch.
    pub queue_capacity: usize,
    pub max_async_jobs_per_acquisition: usize,
    pub max_timer_jobs_per_acquisition: usize,
    /// Wait between acquisition cycles.
    pub acquire_interval: Duration,
    /// Lease granted to claimed executable jobs.
    pub lock_duration: Duration,
    /// Lease granted to claimed timers while they are moved.
    pub timer_lock_duration: Duration,
    pub reset_expired_interval: Duration,
    pub reset_expired_page_size: usize,
    /// Only acquire jobs of this tenant.
    pub tenant_id: Option<String>,
    /// How long shutdown waits for running jobs.
    pub shutdown_timeout: Duration,
}

impl Default for AsyncExecutorConfig {
    fn default() -> Self {
        Self {
            activate: true,
            executor_name: "conveyor".to_string(),
            core_pool_size: 2,
            max_pool_size: 8,
            keep_alive: Duration::from_secs(5),
            queue_capacity: 100,
            max_async_jobs_per_acquisition: 10,
            max_timer_jobs_per_acquisition: 10,
            acquire_interval: Duration::from_secs(1),
            lock_duration: Duration::from_secs(300),
            timer_lock_duration: Duration::from_secs(300),
            reset_expired_interval: Duration::from_secs(60),
            reset_expired_page_size: 3,
            tenant_id: None,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl AsyncExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let src = Source { lookup };
        let d = Self::default();
        let config = Self {
            activate: src.flag("CONVEYOR_EXECUTOR_ACTIVATE", d.activate)?,
            executor_name: src
                .string("CONVEYOR_EXECUTOR_NAME")
                .unwrap_or(d.executor_name),
            core_pool_size: src.parse("CONVEYOR_CORE_POOL_SIZE", d.core_pool_size)?,
            max_pool_size: src.parse("CONVEYOR_MAX_POOL_SIZE", d.max_pool_size)?,
            keep_alive: src.millis("CONVEYOR_KEEP_ALIVE_MS", d.keep_alive)?,
            queue_capacity: src.parse("CONVEYOR_QUEUE_CAPACITY", d.queue_capacity)?,
            max_async_jobs_per_acquisition: src
                .parse("CONVEYOR_ASYNC_BATCH_SIZE", d.max_async_jobs_per_acquisition)?,
            max_timer_jobs_per_acquisition: src
                .parse("CONVEYOR_TIMER_BATCH_SIZE", d.max_timer_jobs_per_acquisition)?,
            acquire_interval: src.millis("CONVEYOR_ACQUIRE_INTERVAL_MS", d.acquire_interval)?,
            lock_duration: src.millis("CONVEYOR_LOCK_DURATION_MS", d.lock_duration)?,
            timer_lock_duration: src
                .millis("CONVEYOR_TIMER_LOCK_DURATION_MS", d.timer_lock_duration)?,
            reset_expired_interval: src
                .millis("CONVEYOR_RESET_EXPIRED_INTERVAL_MS", d.reset_expired_interval)?,
            reset_expired_page_size: src
                .parse("CONVEYOR_RESET_EXPIRED_PAGE_SIZE", d.reset_expired_page_size)?,
            tenant_id: src.string("CONVEYOR_TENANT_ID"),
            shutdown_timeout: src.millis("CONVEYOR_SHUTDOWN_TIMEOUT_MS", d.shutdown_timeout)?,
        };
        config.validate()
    }

    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.max_pool_size == 0 || self.core_pool_size > self.max_pool_size {
            return Err(ConfigError::Invalid {
                key: "CONVEYOR_MAX_POOL_SIZE".to_string(),
                value: self.max_pool_size.to_string(),
                reason: format!(
                    "must be positive and at least the core size ({})",
                    self.core_pool_size
                ),
            });
        }
        if self.lock_duration.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CONVEYOR_LOCK_DURATION_MS".to_string(),
                value: "0".to_string(),
                reason: "lock duration must be positive".to_string(),
            });
        }
        Ok(self)
    }

    pub fn with_executor_name(mut self, name: impl Into<String>) -> Self {
        self.executor_name = name.into();
        self
    }

    pub fn with_pool_size(mut self, core: usize, max: usize) -> Self {
        self.core_pool_size = core;
        self.max_pool_size = max.max(1);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_batch_sizes(mut self, async_jobs: usize, timers: usize) -> Self {
        self.max_async_jobs_per_acquisition = async_jobs;
        self.max_timer_jobs_per_acquisition = timers;
        self
    }

    pub fn with_acquire_interval(mut self, interval: Duration) -> Self {
        self.acquire_interval = interval;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_reset_expired_interval(mut self, interval: Duration) -> Self {
        self.reset_expired_interval = interval;
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Retry delay parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    /// Growth factor per attempt for exponential backoff.
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: 0.0,
        }
    }
}

/// Settings of the job engine shared by every executor of one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Retries given to new jobs.
    pub default_retries: u32,
    pub backoff: BackoffConfig,
    /// Write a `job_history` row when a job completes or is dead-lettered.
    pub record_history: bool,
    /// Inline exception messages are truncated to this many characters.
    pub max_exception_message_len: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_retries: 3,
            backoff: BackoffConfig::default(),
            record_history: false,
            max_exception_message_len: 4000,
        }
    }
}

impl JobConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let src = Source { lookup };
        let d = Self::default();
        let strategy = match src.raw("CONVEYOR_BACKOFF_STRATEGY") {
            None => d.backoff.strategy,
            Some(value) => {
                BackoffStrategy::parse(&value).ok_or_else(|| ConfigError::Invalid {
                    key: "CONVEYOR_BACKOFF_STRATEGY".to_string(),
                    value,
                    reason: "expected fixed, linear or exponential".to_string(),
                })?
            }
        };
        let jitter: f64 = src.parse("CONVEYOR_BACKOFF_JITTER", d.backoff.jitter)?;
        if !(0.0..=1.0).contains(&jitter) {
            return Err(ConfigError::Invalid {
                key: "CONVEYOR_BACKOFF_JITTER".to_string(),
                value: jitter.to_string(),
                reason: "must be between 0 and 1".to_string(),
            });
        }

        Ok(Self {
            default_retries: src.parse("CONVEYOR_JOB_RETRIES", d.default_retries)?,
            backoff: BackoffConfig {
                strategy,
                base_delay: src.millis("CONVEYOR_BACKOFF_BASE_MS", d.backoff.base_delay)?,
                multiplier: src.parse("CONVEYOR_BACKOFF_MULTIPLIER", d.backoff.multiplier)?,
                max_delay: src.millis("CONVEYOR_BACKOFF_MAX_MS", d.backoff.max_delay)?,
                jitter,
            },
            record_history: src.flag("CONVEYOR_JOB_HISTORY", d.record_history)?,
            max_exception_message_len: src
                .parse("CONVEYOR_MAX_EXCEPTION_MESSAGE_LEN", d.max_exception_message_len)?,
        })
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_history(mut self, record_history: bool) -> Self {
        self.record_history = record_history;
        self
    }
}
