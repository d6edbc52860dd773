//! Service configuration read from `SAVING_GOALS_*` environment variables.

use saving_goals::projection::BufferSize;
use saving_goals::subscription::SubscriptionConfig;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every configuration variable.
pub const ENV_PREFIX: &str = "SAVING_GOALS_";

/// A configuration value that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The value does not parse as the expected type.
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        /// Full variable name
        key: String,
        /// Raw value
        value: String,
        /// Parser message
        reason: String,
    },

    /// The value parses but is out of range.
    #[error("{key} must be {expected}")]
    OutOfRange {
        /// Full variable name
        key: String,
        /// Accepted range
        expected: &'static str,
    },
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

/// Everything the service needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Logging settings
    pub log: LogConfig,
    /// Settings shared by every subscription
    pub subscription: SubscriptionConfig,
    /// Page size of projection queries
    pub query_buffer_size: BufferSize,
    /// Time allowed for subscriptions to stop
    pub shutdown_timeout: Duration,
    /// Replay the demonstration workload on startup
    pub run_demo: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log: LogConfig {
                level: "info".to_string(),
                json: false,
            },
            subscription: SubscriptionConfig::default(),
            query_buffer_size: BufferSize::default(),
            shutdown_timeout: Duration::from_secs(10),
            run_demo: true,
        }
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let key = format!("{ENV_PREFIX}{name}");
        match (self.lookup)(&key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigError> {
        let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.get(name, default_ms).map(Duration::from_millis)
    }
}

impl AppConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration through `lookup`, which maps a full variable
    /// name to its value. Unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = Self::default();
        let subscription_defaults = defaults.subscription;

        let batch_size: usize = vars.get("BATCH_SIZE", subscription_defaults.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                key: format!("{ENV_PREFIX}BATCH_SIZE"),
                expected: "at least 1",
            });
        }

        let buffer_size: usize = vars.get("QUERY_BUFFER_SIZE", defaults.query_buffer_size.into_inner())?;
        let query_buffer_size =
            BufferSize::try_new(buffer_size).map_err(|_| ConfigError::OutOfRange {
                key: format!("{ENV_PREFIX}QUERY_BUFFER_SIZE"),
                expected: "at least 1",
            })?;

        let subscription = SubscriptionConfig {
            batch_size,
            max_retries: vars.get("MAX_RETRIES", subscription_defaults.max_retries)?,
            retry_delay: vars.millis("RETRY_DELAY_MS", subscription_defaults.retry_delay)?,
            max_retry_delay: vars.millis(
                "MAX_RETRY_DELAY_MS",
                subscription_defaults.max_retry_delay,
            )?,
        };

        Ok(Self {
            log: LogConfig {
                level: vars.get("LOG_LEVEL", defaults.log.level)?,
                json: vars.get("LOG_JSON", defaults.log.json)?,
            },
            subscription,
            query_buffer_size,
            shutdown_timeout: vars.millis("SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout)?,
            run_demo: vars.get("RUN_DEMO", defaults.run_demo)?,
        })
    }
}
