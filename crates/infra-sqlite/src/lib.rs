// Stepline Infrastructure - SQLite Adapter
// Implements: JobRepository over the batch_* metadata tables, and chunk
// transactions that checkpoints and business writes share

mod connection;
mod job_repository;
mod migration;
mod rows;
mod transaction;

pub use connection::create_pool;
pub use job_repository::SqliteJobRepository;
pub use migration::run_migrations;
pub use transaction::{SqliteTransaction, SqliteTransactionManager};

// Note: sqlx::Error conversion is handled by `map_sqlx_error`
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
