//! Worker and queue configuration
//!
//! Every setting has a default and can be overridden from the environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Worker loop settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Fetch attempts before the loop exits; 0 runs until stopped
    /// (env: DROVER_MAX_ITERATIONS)
    pub max_iterations: u64,
    /// Delay between observing cancellation and exiting
    /// (env: DROVER_SHUTDOWN_COOLDOWN_SECS)
    pub shutdown_cooldown: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0,
            shutdown_cooldown: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Config that stops after `max_iterations` fetch attempts
    pub fn bounded(max_iterations: u64) -> Self {
        Self {
            max_iterations,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            max_iterations: parse_var(&lookup, "DROVER_MAX_ITERATIONS")?
                .unwrap_or(defaults.max_iterations),
            shutdown_cooldown: parse_var(&lookup, "DROVER_SHUTDOWN_COOLDOWN_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_cooldown),
        })
    }

    pub fn is_bounded(&self) -> bool {
        self.max_iterations > 0
    }
}

/// Connection settings for a list-backed queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Backend URL (env: DROVER_REDIS_URL)
    pub url: String,
    /// Base queue name (env: DROVER_QUEUE)
    pub queue: String,
    /// Blocking fetch bound (env: DROVER_WAIT_SECS)
    pub max_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            queue: "default".to_string(),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl QueueSettings {
    /// Load from environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let queue = lookup("DROVER_QUEUE").unwrap_or(defaults.queue);
        if queue.trim().is_empty() {
            return Err(ConfigError::Invalid("DROVER_QUEUE must not be empty".into()));
        }

        Ok(Self {
            url: lookup("DROVER_REDIS_URL").unwrap_or(defaults.url),
            queue,
            max_wait: parse_var(&lookup, "DROVER_WAIT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_wait),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key}={raw} is not a valid number"))),
        None => Ok(None),
    }
}
