//! Environment configuration helpers
//!
//! Every component has a config struct with a `from_env()` constructor
//! built from these helpers. Values are read once at startup and passed
//! to constructors; nothing reads the environment afterwards.

use std::str::FromStr;
use std::time::Duration;

/// Missing or malformed configuration; fatal at startup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable required")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Read a variable, treating an empty value as unset
pub fn env_var(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Read a required variable
pub fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env_var(key).ok_or(ConfigError::Missing(key))
}

/// Read and parse a variable, falling back to `default` when unset
pub fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        None => Ok(default),
        Some(value) => parse_value(key, &value),
    }
}

/// Read a humantime duration ("90s", "1m", "365d"); `None` when unset
pub fn env_duration(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    env_var(key)
        .map(|value| parse_duration(key, &value))
        .transpose()
}

/// Parse a humantime duration for `key`
pub fn parse_duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: e.to_string(),
        })
}
