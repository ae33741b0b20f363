//! Worker configuration
//!
//! Loaded once by each binary and passed to constructors.

use std::time::Duration;

use calendar_core::config::env_duration;
use calendar_core::ConfigError;
use calendar_queue::QueueConfig;
use calendar_storage::StorageConfig;

/// Default interval between scans
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Queue backend the binaries use when `CALENDAR_QUEUE` is unset
///
/// Scheduler and sender are separate processes, so a process-local queue
/// would never reach the sender.
const DEFAULT_QUEUE_BACKEND: &str = "postgres";

/// Scheduler process configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scans; the first scan runs immediately
    pub scan_timeout: Duration,
    /// Events that ended longer ago than this are deleted; `None` keeps everything
    pub retention: Option<Duration>,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            retention: None,
            storage: StorageConfig::InMemory,
            queue: QueueConfig::InMemory {
                capacity: calendar_queue::DEFAULT_CAPACITY,
            },
        }
    }
}

impl SchedulerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `CALENDAR_SCAN_TIMEOUT`: scan interval, e.g. "30s" (default: "1m")
    /// - `CALENDAR_RETENTION`: delete events that ended this long ago, e.g. "365d"
    /// - storage and queue variables, see [`StorageConfig`] and [`QueueConfig`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let scan_timeout = env_duration("CALENDAR_SCAN_TIMEOUT")?.unwrap_or(DEFAULT_SCAN_TIMEOUT);
        if scan_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CALENDAR_SCAN_TIMEOUT",
                value: "0".to_string(),
                reason: "scan interval must be positive".to_string(),
            });
        }

        Ok(Self {
            scan_timeout,
            retention: env_duration("CALENDAR_RETENTION")?,
            storage: StorageConfig::from_env()?,
            queue: QueueConfig::from_env(DEFAULT_QUEUE_BACKEND)?,
        })
    }

    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }
}

/// Sender process configuration
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub queue: QueueConfig,
}

impl SenderConfig {
    /// Create configuration from environment variables
    ///
    /// Only the queue variables apply, see [`QueueConfig`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            queue: QueueConfig::from_env(DEFAULT_QUEUE_BACKEND)?,
        })
    }
}
