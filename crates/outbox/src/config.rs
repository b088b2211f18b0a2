//! Delivery configuration.
//!
//! Recognized environment variables (all optional, with defaults):
//!
//! | Variable | Effect |
//! |---|---|
//! | `OUTBOX_ENABLED` | when false, workers sleep but never lease |
//! | `OUTBOX_WORKERS` | worker count |
//! | `OUTBOX_BATCH_SIZE` | records leased per poll |
//! | `OUTBOX_WAIT_TIME_MS` | sleep between polls |
//! | `OUTBOX_IN_PROGRESS_TTL_MS` | lease TTL |
//! | `OUTBOX_ATTEMPTS_RETRY` | retry ceiling for abandonment |
//! | `OUTBOX_AUTHOR_SEND_URL` | author sink URL (required when enabled) |
//! | `OUTBOX_BOOK_SEND_URL` | book sink URL (required when enabled) |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

use crate::scheduler::SchedulerConfig;

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_BATCH_SIZE: u32 = 100;
const DEFAULT_WAIT_TIME: Duration = Duration::from_millis(100);
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);
const DEFAULT_ATTEMPTS_RETRY: u32 = 2000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(var: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            reason: reason.into(),
        }
    }
}

/// Outbox delivery options.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub workers: usize,
    pub batch_size: u32,
    pub wait_time: Duration,
    pub lease_ttl: Duration,
    pub attempts_retry: u32,
    pub author_send_url: Option<Url>,
    pub book_send_url: Option<Url>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            wait_time: DEFAULT_WAIT_TIME,
            lease_ttl: DEFAULT_LEASE_TTL,
            attempts_retry: DEFAULT_ATTEMPTS_RETRY,
            author_send_url: None,
            book_send_url: None,
        }
    }
}

impl OutboxConfig {
    /// Read the configuration from the environment; unset variables keep
    /// their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: env_parse("OUTBOX_ENABLED", false)?,
            workers: env_parse("OUTBOX_WORKERS", DEFAULT_WORKERS)?,
            batch_size: env_parse("OUTBOX_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            wait_time: env_millis("OUTBOX_WAIT_TIME_MS", DEFAULT_WAIT_TIME)?,
            lease_ttl: env_millis("OUTBOX_IN_PROGRESS_TTL_MS", DEFAULT_LEASE_TTL)?,
            attempts_retry: env_parse("OUTBOX_ATTEMPTS_RETRY", DEFAULT_ATTEMPTS_RETRY)?,
            author_send_url: env_url("OUTBOX_AUTHOR_SEND_URL")?,
            book_send_url: env_url("OUTBOX_BOOK_SEND_URL")?,
        })
    }

    /// Enforce the declared bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers < 1 {
            return Err(ConfigError::invalid("OUTBOX_WORKERS", "must be at least 1"));
        }
        if self.batch_size < 1 {
            return Err(ConfigError::invalid(
                "OUTBOX_BATCH_SIZE",
                "must be at least 1",
            ));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::invalid(
                "OUTBOX_IN_PROGRESS_TTL_MS",
                "must be positive",
            ));
        }
        if self.attempts_retry < 1 {
            return Err(ConfigError::invalid(
                "OUTBOX_ATTEMPTS_RETRY",
                "must be at least 1",
            ));
        }
        if self.enabled {
            if self.author_send_url.is_none() {
                return Err(ConfigError::invalid(
                    "OUTBOX_AUTHOR_SEND_URL",
                    "required when the outbox is enabled",
                ));
            }
            if self.book_send_url.is_none() {
                return Err(ConfigError::invalid(
                    "OUTBOX_BOOK_SEND_URL",
                    "required when the outbox is enabled",
                ));
            }
        }
        Ok(())
    }

    /// Scheduler view of this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            enabled: self.enabled,
            workers: self.workers,
            batch_size: self.batch_size,
            wait_time: self.wait_time,
            lease_ttl: self.lease_ttl,
        }
    }
}

fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::invalid(var, format!("{e}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse::<u64>(var, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_url(var: &'static str) -> Result<Option<Url>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid(var, format!("{e}"))),
        Err(_) => Ok(None),
    }
}
