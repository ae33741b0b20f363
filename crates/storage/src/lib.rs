// Calendar event storage
//
// One Storage trait with two implementations:
// - InMemoryStorage: rw-lock guarded map for dev mode and tests
// - PostgresStorage: PostgreSQL via sqlx for production
//
// Workers hold an Arc<dyn Storage> built by create_storage().

mod config;
mod memory;
mod postgres;
mod store;

pub use config::{create_storage, StorageConfig};
pub use memory::InMemoryStorage;
pub use postgres::{PostgresStorage, PostgresStorageConfig, DEFAULT_CALL_TIMEOUT};
pub use store::{Storage, StorageError};
