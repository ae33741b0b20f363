//! PostgreSQL-backed implementation of Queue
//!
//! Messages live in one UNLOGGED table shared by every named queue:
//! - `push` inserts a row and `pg_notify`s the queue's channel
//! - the consumer LISTENs on that channel and deletes one row at a time
//!   with SKIP LOCKED before yielding it, so a message counts as delivered
//!   once it leaves the table (at-most-once)
//! - a fallback poll picks up anything whose notification was missed
//!
//! Rows are never removed ahead of the caller, so stopping the consumer
//! between items leaves the rest queued. A crash, or a stop that cancels a
//! fetch in flight, can still lose the one row being removed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use calendar_core::{Event, NotificationPayload, RetryPolicy};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::queue::*;

/// How often the consumer polls when no notification arrives
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const CHANNEL_PREFIX: &str = "calendar_queue_";

/// Longest queue name whose channel fits PostgreSQL's 63-byte identifier limit
pub const MAX_QUEUE_NAME_LEN: usize = 63 - CHANNEL_PREFIX.len();

/// Connection settings for [`PostgresQueue::connect`]
#[derive(Clone)]
pub struct PostgresQueueConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub queue_name: String,
    pub connect_retries: u32,
    pub poll_interval: Duration,
}

impl std::fmt::Debug for PostgresQueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueueConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("queue_name", &self.queue_name)
            .field("connect_retries", &self.connect_retries)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "calendar".to_string(),
            queue_name: "notifications".to_string(),
            connect_retries: 5,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PostgresQueueConfig {
    fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        options
    }
}

/// Check that a queue name maps to a usable notification channel
pub fn check_queue_name(queue_name: &str) -> Result<(), String> {
    if queue_name.is_empty() {
        return Err("queue name is empty".to_string());
    }
    if queue_name.len() > MAX_QUEUE_NAME_LEN {
        return Err(format!(
            "queue name is {} bytes, at most {MAX_QUEUE_NAME_LEN} allowed",
            queue_name.len()
        ));
    }
    Ok(())
}

/// Notification channel for a queue name
fn channel_name(queue_name: &str) -> Result<String, QueueError> {
    check_queue_name(queue_name).map_err(QueueError::InvalidName)?;
    Ok(format!("{CHANNEL_PREFIX}{queue_name}"))
}

/// PostgreSQL-backed queue shared by the scheduler and sender processes
pub struct PostgresQueue {
    pool: PgPool,
    queue_name: String,
    channel: String,
    poll_interval: Duration,
    closed: watch::Sender<bool>,
    consuming: AtomicBool,
}

impl PostgresQueue {
    /// Connect (retrying) and declare the queue table
    pub async fn connect(config: &PostgresQueueConfig) -> Result<Self, QueueError> {
        check_queue_name(&config.queue_name).map_err(QueueError::InvalidName)?;

        let options = config.connect_options();
        let policy = RetryPolicy::connect(config.connect_retries);
        let pool = policy
            .retry("postgres-queue", || {
                PgPoolOptions::new()
                    .max_connections(4)
                    .connect_with(options.clone())
            })
            .await
            .map_err(|e| {
                error!("Failed to connect to queue database: {}", e);
                QueueError::Connection(e.to_string())
            })?;

        let queue = Self::from_pool(pool, &config.queue_name, config.poll_interval)?;
        queue.declare().await?;
        info!(queue = %queue.queue_name, "Connected to notification queue");
        Ok(queue)
    }

    /// Wrap an existing pool; call [`PostgresQueue::declare`] before use
    pub fn from_pool(
        pool: PgPool,
        queue_name: &str,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let channel = channel_name(queue_name)?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            pool,
            queue_name: queue_name.to_string(),
            channel,
            poll_interval,
            closed,
            consuming: AtomicBool::new(false),
        })
    }

    /// Create the queue table if it does not exist yet
    ///
    /// Serialized with an advisory lock so both processes can declare at startup.
    pub async fn declare(&self) -> Result<(), QueueError> {
        let mut tx = self.pool.begin().await.map_err(connection_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext('calendar_notification_queue'))")
            .execute(&mut *tx)
            .await
            .map_err(connection_error)?;

        sqlx::query(
            r#"
            CREATE UNLOGGED TABLE IF NOT EXISTS calendar_notification_queue (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(connection_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_calendar_notification_queue_name \
             ON calendar_notification_queue (queue_name, id)",
        )
        .execute(&mut *tx)
        .await
        .map_err(connection_error)?;

        tx.commit().await.map_err(connection_error)
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of messages waiting in this queue
    pub async fn pending(&self) -> Result<i64, QueueError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM calendar_notification_queue WHERE queue_name = $1")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(connection_error)
    }

    async fn listen(&self) -> Result<PgListener, QueueError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(connection_error)?;
        listener
            .listen(&self.channel)
            .await
            .map_err(connection_error)?;
        Ok(listener)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn connection_error(e: sqlx::Error) -> QueueError {
    QueueError::Connection(e.to_string())
}

#[async_trait]
impl Queue for PostgresQueue {
    #[instrument(skip(self, event), fields(queue = %self.queue_name, event_id = event.id))]
    async fn push(&self, event: &Event) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let payload = NotificationPayload::from(event).to_json()?;
        sqlx::query(
            r#"
            WITH inserted AS (
                INSERT INTO calendar_notification_queue (queue_name, payload)
                VALUES ($1, $2)
                RETURNING id
            )
            SELECT pg_notify($3, inserted.id::text) FROM inserted
            "#,
        )
        .bind(&self.queue_name)
        .bind(payload)
        .bind(&self.channel)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to push notification: {}", e);
            connection_error(e)
        })?;

        debug!("queued notification");
        Ok(())
    }

    async fn consume(&self) -> Result<NotificationStream, QueueError> {
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyConsuming);
        }

        let listener = match self.listen().await {
            Ok(listener) => listener,
            Err(e) => {
                self.consuming.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let state = ConsumerState {
            pool: self.pool.clone(),
            queue_name: self.queue_name.clone(),
            listener,
            closed: self.closed.subscribe(),
            poll_interval: self.poll_interval,
        };

        info!(queue = %self.queue_name, "Consuming notification queue");
        Ok(Box::pin(futures::stream::unfold(state, |mut state| async move {
            state.next().await.map(|item| (item, state))
        })))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.send_replace(true) {
            info!(queue = %self.queue_name, "Closed notification queue");
        }
        Ok(())
    }
}

/// Consumer side of a [`PostgresQueue`]
struct ConsumerState {
    pool: PgPool,
    queue_name: String,
    listener: PgListener,
    closed: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl ConsumerState {
    /// Next item, or `None` once the queue is closed
    async fn next(&mut self) -> Option<Result<NotificationPayload, QueueError>> {
        loop {
            // Closed, or the queue handle itself was dropped
            if *self.closed.borrow_and_update() || self.closed.has_changed().is_err() {
                return None;
            }

            let failure = match self.fetch().await {
                Ok(Some(item)) => return Some(item),
                Ok(None) => self.wait_for_message().await.err(),
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                // Back off before the caller asks again
                if !self.pause().await {
                    return None;
                }
                return Some(Err(e));
            }
        }
    }

    /// Wait for a notification or the poll interval
    ///
    /// Returns `Ok` on close too; the loop checks the flag next.
    async fn wait_for_message(&mut self) -> Result<(), QueueError> {
        tokio::select! {
            _ = self.closed.changed() => Ok(()),
            notification = self.listener.recv() => {
                notification.map(|_| ()).map_err(|e| {
                    // The listener reconnects on the next recv
                    warn!(queue = %self.queue_name, error = %e, "Queue listener interrupted");
                    connection_error(e)
                })
            }
            _ = tokio::time::sleep(self.poll_interval) => Ok(()),
        }
    }

    /// Sleep one poll interval; false if the queue closed meanwhile
    async fn pause(&mut self) -> bool {
        tokio::select! {
            _ = self.closed.changed() => false,
            _ = tokio::time::sleep(self.poll_interval) => !*self.closed.borrow(),
        }
    }

    /// Remove the oldest message, if any
    async fn fetch(&self) -> Result<Option<Result<NotificationPayload, QueueError>>, QueueError> {
        let row: Option<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            DELETE FROM calendar_notification_queue
            WHERE id = (
                SELECT id
                FROM calendar_notification_queue
                WHERE queue_name = $1
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload
            "#,
        )
        .bind(&self.queue_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(connection_error)?;

        Ok(row.map(|(id, payload)| {
            NotificationPayload::from_json(payload).map_err(|e| {
                error!(message_id = id, error = %e, "Dropping undecodable notification");
                QueueError::from(e)
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name() {
        assert_eq!(
            channel_name("notifications").unwrap(),
            "calendar_queue_notifications"
        );
    }

    #[test]
    fn test_channel_name_fits_identifier_limit() {
        let longest = "q".repeat(MAX_QUEUE_NAME_LEN);
        assert_eq!(channel_name(&longest).unwrap().len(), 63);

        let too_long = "q".repeat(MAX_QUEUE_NAME_LEN + 1);
        assert!(matches!(
            channel_name(&too_long),
            Err(QueueError::InvalidName(_))
        ));
        assert!(matches!(channel_name(""), Err(QueueError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_from_pool_rejects_long_name() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://postgres@localhost:5432/calendar_test")
            .unwrap();
        let name = "reminders_for_the_entire_engineering_organisation_v2";
        assert!(name.len() > MAX_QUEUE_NAME_LEN);

        let result = PostgresQueue::from_pool(pool, name, DEFAULT_POLL_INTERVAL);
        assert!(matches!(result, Err(QueueError::InvalidName(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_long_name_before_connecting() {
        let config = PostgresQueueConfig {
            port: 1,
            queue_name: "n".repeat(56),
            ..Default::default()
        };
        assert!(matches!(
            PostgresQueue::connect(&config).await,
            Err(QueueError::InvalidName(_))
        ));
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = PostgresQueueConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }
}
