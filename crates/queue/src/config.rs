// Queue backend selection

use std::sync::Arc;

use calendar_core::config::{env_duration, env_var, parse_env};
use calendar_core::ConfigError;
use tracing::info;

use crate::memory::{InMemoryQueue, DEFAULT_CAPACITY};
use crate::postgres::{check_queue_name, PostgresQueue, PostgresQueueConfig};
use crate::queue::{Queue, QueueError};

/// Which queue backend to build
#[derive(Debug, Clone)]
pub enum QueueConfig {
    /// Bounded channel inside one process
    InMemory { capacity: usize },
    /// PostgreSQL-backed queue shared between processes
    Postgres(PostgresQueueConfig),
}

impl QueueConfig {
    /// Read `CALENDAR_QUEUE` (`memory` | `postgres`)
    ///
    /// `default_backend` applies when the variable is unset; the binaries
    /// default to `postgres` since scheduler and sender are separate processes.
    pub fn from_env(default_backend: &str) -> Result<Self, ConfigError> {
        let backend = env_var("CALENDAR_QUEUE").unwrap_or_else(|| default_backend.to_string());

        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(Self::InMemory {
                capacity: parse_env("QUEUE_CAPACITY", DEFAULT_CAPACITY)?,
            }),
            "postgres" | "postgresql" => {
                let defaults = PostgresQueueConfig::default();
                Ok(Self::Postgres(PostgresQueueConfig {
                    host: parse_env("QUEUE_HOST", defaults.host)?,
                    port: parse_env("QUEUE_PORT", defaults.port)?,
                    user: parse_env("QUEUE_USER", defaults.user)?,
                    password: parse_env("QUEUE_PASSWORD", defaults.password)?,
                    database: parse_env("QUEUE_DATABASE", defaults.database)?,
                    queue_name: queue_name(parse_env("QUEUE_NAME", defaults.queue_name)?)?,
                    connect_retries: parse_env("QUEUE_CONNECT_RETRIES", defaults.connect_retries)?,
                    poll_interval: env_duration("QUEUE_POLL_INTERVAL")?
                        .unwrap_or(defaults.poll_interval),
                }))
            }
            _ => Err(ConfigError::Invalid {
                key: "CALENDAR_QUEUE",
                value: backend,
                reason: "expected 'memory' or 'postgres'".to_string(),
            }),
        }
    }
}

/// Reject `QUEUE_NAME` values that cannot become a notification channel
fn queue_name(value: String) -> Result<String, ConfigError> {
    match check_queue_name(&value) {
        Ok(()) => Ok(value),
        Err(reason) => Err(ConfigError::Invalid {
            key: "QUEUE_NAME",
            value,
            reason,
        }),
    }
}

/// Build the configured queue backend
///
/// PostgreSQL is connected (with bounded retries) and the queue table
/// declared before this returns.
pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn Queue>, QueueError> {
    match config {
        QueueConfig::InMemory { capacity } => {
            info!(capacity, "Using in-memory notification queue (dev mode)");
            Ok(Arc::new(InMemoryQueue::new(*capacity)))
        }
        QueueConfig::Postgres(pg) => {
            let queue = PostgresQueue::connect(pg).await?;
            Ok(Arc::new(queue))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calendar_core::{DateTime, Event};
    use futures::StreamExt;

    #[test]
    fn test_queue_name_length_checked() {
        assert_eq!(
            queue_name("notifications".to_string()).unwrap(),
            "notifications"
        );
        assert!(matches!(
            queue_name("x".repeat(56)),
            Err(ConfigError::Invalid { key: "QUEUE_NAME", .. })
        ));
    }

    #[tokio::test]
    async fn test_create_in_memory_queue() {
        let queue = create_queue(&QueueConfig::InMemory { capacity: 2 })
            .await
            .unwrap();

        let start = DateTime::from_ymd_hm(2024, 4, 2, 10, 0).unwrap();
        let mut event = Event::new("retro", start, start);
        event.id = 7;
        queue.push(&event).await.unwrap();

        let mut stream = queue.consume().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().id, 7);
    }
}
