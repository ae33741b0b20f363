//! PostgreSQL implementation of Storage
//!
//! Production persistence using PostgreSQL with:
//! - A stored, indexed `notify_at` column so reminder scans are range queries
//! - A fixed deadline on every call
//! - Bounded connection retries at construction only
//!
//! The reminder query and the later mark are separate statements, not one
//! transaction. This is safe with a single active scheduler, which is the
//! supported deployment; two schedulers on one database could both pick up
//! an event before either marks it.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use calendar_core::{DateTime, Event, EventId, RetryPolicy};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::{debug, error, info, instrument};

use super::store::*;

/// Deadline applied to every storage call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_COLUMNS: &str =
    "id, name, start_at, end_at, notify_enabled, before_minutes, notified_at";

/// Row shape of the `events` table
#[derive(Debug, FromRow)]
struct EventRow {
    id: i64,
    name: String,
    start_at: chrono::DateTime<Utc>,
    end_at: chrono::DateTime<Utc>,
    notify_enabled: bool,
    before_minutes: i64,
    notified_at: Option<chrono::DateTime<Utc>>,
}

impl TryFrom<EventRow> for Event {
    type Error = StorageError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let before_minutes = u32::try_from(row.before_minutes).map_err(|_| {
            StorageError::Database(format!(
                "event {} has out-of-range before_minutes {}",
                row.id, row.before_minutes
            ))
        })?;

        Ok(Event {
            id: row.id,
            name: row.name,
            start: row.start_at.into(),
            end: row.end_at.into(),
            notifying_enabled: row.notify_enabled,
            before_minutes,
            notified_at: row.notified_at.map(DateTime::from),
        })
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<Event>, StorageError> {
    rows.into_iter().map(Event::try_from).collect()
}

/// Connection settings for [`PostgresStorage::connect`]
#[derive(Clone)]
pub struct PostgresStorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connect_retries: u32,
    pub call_timeout: Duration,
}

impl std::fmt::Debug for PostgresStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL may embed a password
        f.debug_struct("PostgresStorageConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("connect_retries", &self.connect_retries)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl PostgresStorageConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            connect_retries: 5,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// PostgreSQL implementation of Storage
///
/// # Example
///
/// ```ignore
/// use calendar_storage::{PostgresStorage, PostgresStorageConfig};
///
/// let storage = PostgresStorage::connect(&PostgresStorageConfig::new(url)).await?;
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    call_timeout: Duration,
}

impl PostgresStorage {
    /// Wrap an existing pool; the schema is assumed to be migrated
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Connect (retrying), then apply migrations
    pub async fn connect(config: &PostgresStorageConfig) -> Result<Self, StorageError> {
        let policy = RetryPolicy::connect(config.connect_retries);
        let pool = policy
            .retry("postgres-storage", || {
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.call_timeout)
                    .connect(&config.database_url)
            })
            .await
            .map_err(|e| {
                error!("Failed to connect to event database: {}", e);
                StorageError::Database(e.to_string())
            })?;

        let storage = Self {
            pool,
            call_timeout: config.call_timeout,
        };
        storage.migrate().await?;
        info!("Connected to event database");
        Ok(storage)
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run one database call under the per-call deadline
    async fn deadline<T, F>(&self, operation: &'static str, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(operation, "Storage call failed: {}", e);
                Err(StorageError::Database(e.to_string()))
            }
            Err(_) => {
                error!(
                    operation,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Storage call timed out"
                );
                Err(StorageError::Timeout(self.call_timeout))
            }
        }
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    #[instrument(skip(self, event), fields(name = %event.name))]
    async fn add_event(&self, event: Event) -> Result<EventId, StorageError> {
        event.validate()?;

        let id: i64 = self
            .deadline(
                "add_event",
                sqlx::query_scalar(
                    r#"
                    INSERT INTO events (
                        name, start_at, end_at, notify_enabled,
                        before_minutes, notify_at, notified_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id
                    "#,
                )
                .bind(&event.name)
                .bind(event.start.as_chrono())
                .bind(event.end.as_chrono())
                .bind(event.notifying_enabled)
                .bind(i64::from(event.before_minutes))
                .bind(event.notify_time().as_chrono())
                .bind(event.notified_at.map(|d| d.as_chrono()))
                .fetch_one(&self.pool),
            )
            .await?;

        debug!(id, "added event");
        Ok(id)
    }

    #[instrument(skip(self, event))]
    async fn update_event(&self, id: EventId, event: Event) -> Result<(), StorageError> {
        event.validate()?;

        let result = self
            .deadline(
                "update_event",
                sqlx::query(
                    r#"
                    UPDATE events
                    SET name = $2,
                        start_at = $3,
                        end_at = $4,
                        notify_enabled = $5,
                        before_minutes = $6,
                        notify_at = $7
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(&event.name)
                .bind(event.start.as_chrono())
                .bind(event.end.as_chrono())
                .bind(event.notifying_enabled)
                .bind(i64::from(event.before_minutes))
                .bind(event.notify_time().as_chrono())
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_event(&self, id: EventId) -> Result<(), StorageError> {
        let result = self
            .deadline(
                "delete_event",
                sqlx::query("DELETE FROM events WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_event(&self, id: EventId) -> Result<Event, StorageError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1");
        self.deadline(
            "get_event",
            sqlx::query_as::<_, EventRow>(&sql)
                .bind(id)
                .fetch_optional(&self.pool),
        )
        .await?
        .ok_or(StorageError::EventNotFound(id))?
        .try_into()
    }

    #[instrument(skip(self))]
    async fn get_all_events(&self) -> Result<Vec<Event>, StorageError> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY start_at, end_at, id");
        let rows = self
            .deadline(
                "get_all_events",
                sqlx::query_as::<_, EventRow>(&sql).fetch_all(&self.pool),
            )
            .await?;
        into_events(rows)
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn get_events_by_period(
        &self,
        from: DateTime,
        to: DateTime,
    ) -> Result<Vec<Event>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE start_at >= $1 AND start_at <= $2 \
             ORDER BY start_at, end_at, id"
        );
        let rows = self
            .deadline(
                "get_events_by_period",
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(from.as_chrono())
                    .bind(to.as_chrono())
                    .fetch_all(&self.pool),
            )
            .await?;
        into_events(rows)
    }

    #[instrument(skip(self))]
    async fn get_events_to_notify(
        &self,
        from: Option<DateTime>,
        to: Option<DateTime>,
    ) -> Result<Vec<Event>, StorageError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE notify_enabled \
               AND notified_at IS NULL \
               AND ($1::timestamptz IS NULL OR notify_at >= $1) \
               AND ($2::timestamptz IS NULL OR notify_at <= $2) \
             ORDER BY start_at, end_at, id"
        );
        let rows = self
            .deadline(
                "get_events_to_notify",
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(from.map(|d| d.as_chrono()))
                    .bind(to.map(|d| d.as_chrono()))
                    .fetch_all(&self.pool),
            )
            .await?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "found events to notify");
        }
        into_events(rows)
    }

    #[instrument(skip(self), fields(when = %when))]
    async fn mark_event_as_notified(
        &self,
        id: EventId,
        when: DateTime,
    ) -> Result<(), StorageError> {
        let result = self
            .deadline(
                "mark_event_as_notified",
                sqlx::query("UPDATE events SET notified_at = $2 WHERE id = $1")
                    .bind(id)
                    .bind(when.as_chrono())
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn delete_events_ended_before(&self, cutoff: DateTime) -> Result<u64, StorageError> {
        let result = self
            .deadline(
                "delete_events_ended_before",
                sqlx::query("DELETE FROM events WHERE end_at < $1")
                    .bind(cutoff.as_chrono())
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn count(&self) -> Result<usize, StorageError> {
        let count: i64 = self
            .deadline(
                "count",
                sqlx::query_scalar("SELECT COUNT(*) FROM events").fetch_one(&self.pool),
            )
            .await?;
        Ok(count as usize)
    }

    #[instrument(skip(self))]
    async fn clear_all(&self) -> Result<(), StorageError> {
        self.deadline(
            "clear_all",
            sqlx::query("DELETE FROM events").execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}
