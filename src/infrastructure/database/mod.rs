//! SQLite persistence: connection pool, output store, job queue, attempts.

mod attempts;
mod connection;
mod job_queue;
mod output_store;

pub use attempts::AttemptLog;
pub use connection::DatabaseConnection;
pub use job_queue::SqliteJobQueue;
pub use output_store::SqliteOutputStore;
