// Calendar notification queues
//
// One Queue trait with two implementations:
// - InMemoryQueue: bounded channel for dev mode and tests
// - PostgresQueue: table + LISTEN/NOTIFY for separate scheduler and sender processes
//
// Workers hold an Arc<dyn Queue> built by create_queue().

mod config;
mod memory;
mod postgres;
mod queue;

pub use config::{create_queue, QueueConfig};
pub use memory::{InMemoryQueue, DEFAULT_CAPACITY};
pub use postgres::{
    check_queue_name, PostgresQueue, PostgresQueueConfig, DEFAULT_POLL_INTERVAL,
    MAX_QUEUE_NAME_LEN,
};
pub use queue::{NotificationStream, Queue, QueueError};
