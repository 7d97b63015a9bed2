// Engine configuration
//
// Loaded from environment variables. The CLI loads a `.env` file first.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-level settings for the demo engine wiring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub redis_url: String,

    pub sorted_queue: String,
    pub sorted_consumers: usize,
    pub sorted_consuming: usize,
    pub sorted_max_retries: u32,

    pub stream: String,
    pub stream_group: String,
    pub stream_consumers: usize,
    pub stream_retries: u32,

    /// How long shutdown waits for every pool before reporting a timeout.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            sorted_queue: "test".to_string(),
            sorted_consumers: 2,
            sorted_consuming: 2,
            sorted_max_retries: 3,
            stream: "usersTest".to_string(),
            stream_group: "registerUsers".to_string(),
            stream_consumers: 2,
            stream_retries: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `REDIS_URL`: store URL (default: redis://localhost:6379)
    /// - `SPINDLE_SORTED_QUEUE`: sorted queue name (default: test)
    /// - `SPINDLE_SORTED_CONSUMERS`: sorted queue workers (default: 2)
    /// - `SPINDLE_SORTED_CONSUMING`: pop-min batch size (default: 2)
    /// - `SPINDLE_SORTED_MAX_RETRIES`: sorted entry retry budget (default: 3)
    /// - `SPINDLE_STREAM` / `SPINDLE_STREAM_GROUP`: stream and group names
    /// - `SPINDLE_STREAM_CONSUMERS`: stream workers (default: 2)
    /// - `SPINDLE_STREAM_RETRIES`: stream retry budget (default: 3)
    /// - `SPINDLE_SHUTDOWN_TIMEOUT_SECS`: shutdown wait (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(Self {
            redis_url: text("REDIS_URL", d.redis_url),
            sorted_queue: text("SPINDLE_SORTED_QUEUE", d.sorted_queue),
            sorted_consumers: parsed(&lookup, "SPINDLE_SORTED_CONSUMERS", d.sorted_consumers)?,
            sorted_consuming: parsed(&lookup, "SPINDLE_SORTED_CONSUMING", d.sorted_consuming)?,
            sorted_max_retries: parsed(
                &lookup,
                "SPINDLE_SORTED_MAX_RETRIES",
                d.sorted_max_retries,
            )?,
            stream: text("SPINDLE_STREAM", d.stream),
            stream_group: text("SPINDLE_STREAM_GROUP", d.stream_group),
            stream_consumers: parsed(&lookup, "SPINDLE_STREAM_CONSUMERS", d.stream_consumers)?,
            stream_retries: parsed(&lookup, "SPINDLE_STREAM_RETRIES", d.stream_retries)?,
            shutdown_timeout: Duration::from_secs(parsed(
                &lookup,
                "SPINDLE_SHUTDOWN_TIMEOUT_SECS",
                d.shutdown_timeout.as_secs(),
            )?),
        })
    }
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
