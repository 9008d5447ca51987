//! Engine configuration from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `BACKFILL_BATCH_SIZE` | 100 |
//! | `BACKFILL_MAX_PARALLEL_BATCHES` | 5 |
//! | `BACKFILL_STREAM_CONCURRENCY` | 8 |
//! | `BACKFILL_STREAM_BUFFER` | 16 |
//! | `BACKFILL_MAX_RETRIES` | 3 |
//! | `BACKFILL_RETRY_BASE_DELAY_MS` | 500 |
//! | `BACKFILL_RETRY_MAX_DELAY_MS` | 30000 |
//! | `DATABASE_URL` | unset (in-memory checkpoints) |
//! | `BACKFILL_LISTEN_ADDR` | `0.0.0.0:8080` |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use backfill_core::{BatchingOptions, ConfigurationError};

use crate::retry::RetryPolicy;
use crate::stream::StreamOptions;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default batching for jobs that do not bring their own.
    pub batching: BatchingOptions,
    /// Per-batch record concurrency.
    pub stream: StreamOptions,
    pub retry: RetryPolicy,
    /// Postgres checkpoint store; in-memory when absent.
    pub database_url: Option<String>,
    pub listen_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batching: BatchingOptions::default(),
            stream: StreamOptions::default(),
            retry: RetryPolicy::default(),
            database_url: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let batching = BatchingOptions::new(
            parse_or(&lookup, "BACKFILL_BATCH_SIZE", defaults.batching.size())?,
            parse_or(
                &lookup,
                "BACKFILL_MAX_PARALLEL_BATCHES",
                defaults.batching.max_parallel_count(),
            )?,
        )?;

        let stream = StreamOptions::new(
            parse_or(&lookup, "BACKFILL_STREAM_CONCURRENCY", defaults.stream.max_concurrency)?,
            parse_or(&lookup, "BACKFILL_STREAM_BUFFER", defaults.stream.buffer_capacity)?,
        )?;

        let retry = RetryPolicy {
            max_retries: parse_or(&lookup, "BACKFILL_MAX_RETRIES", defaults.retry.max_retries)?,
            base_delay: Duration::from_millis(parse_or(
                &lookup,
                "BACKFILL_RETRY_BASE_DELAY_MS",
                millis(defaults.retry.base_delay),
            )?),
            max_delay: Duration::from_millis(parse_or(
                &lookup,
                "BACKFILL_RETRY_MAX_DELAY_MS",
                millis(defaults.retry.max_delay),
            )?),
            ..defaults.retry
        };

        let config = Self {
            batching,
            stream,
            retry,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            listen_addr: lookup("BACKFILL_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.stream.validate()?;
        self.retry.validate()?;
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigurationError::new("listen_addr", "must not be empty"));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigurationError::new(key, format!("{raw:?}: {e}"))),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
