// Storage backend selection
// Decision: Trait objects over enum dispatch so workers stay backend-agnostic

use std::sync::Arc;

use calendar_core::config::{env_var, parse_env, require_env};
use calendar_core::ConfigError;
use tracing::info;

use crate::memory::InMemoryStorage;
use crate::postgres::{PostgresStorage, PostgresStorageConfig};
use crate::store::{Storage, StorageError};

/// Which storage backend to build
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// Process-local map (dev mode, tests)
    InMemory,
    /// PostgreSQL database (production)
    Postgres(PostgresStorageConfig),
}

impl StorageConfig {
    /// Read `CALENDAR_STORAGE` (`memory` | `postgres`, default `memory`)
    ///
    /// The postgres backend needs `DATABASE_URL`; `DATABASE_CONNECT_RETRIES`
    /// defaults to 5.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = env_var("CALENDAR_STORAGE").unwrap_or_else(|| "memory".to_string());

        match backend.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(Self::InMemory),
            "postgres" | "postgresql" => {
                let mut config = PostgresStorageConfig::new(require_env("DATABASE_URL")?);
                config.connect_retries = parse_env("DATABASE_CONNECT_RETRIES", 5)?;
                Ok(Self::Postgres(config))
            }
            _ => Err(ConfigError::Invalid {
                key: "CALENDAR_STORAGE",
                value: backend,
                reason: "expected 'memory' or 'postgres'".to_string(),
            }),
        }
    }

    /// Check if this is dev mode (in-memory)
    pub fn is_dev_mode(&self) -> bool {
        matches!(self, Self::InMemory)
    }
}

/// Build the configured storage backend
///
/// PostgreSQL is connected (with bounded retries) and migrated before this
/// returns.
pub async fn create_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    match config {
        StorageConfig::InMemory => {
            info!("Using in-memory event storage (dev mode)");
            Ok(Arc::new(InMemoryStorage::new()))
        }
        StorageConfig::Postgres(pg) => {
            let storage = PostgresStorage::connect(pg).await?;
            Ok(Arc::new(storage))
        }
    }
}
