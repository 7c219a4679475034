//! db-resilience library
//!
//! A resilience layer in front of relational databases (PostgreSQL,
//! MySQL/MariaDB, SQLite): provider selection, connection pooling,
//! transactions with savepoints, retry with backoff and node failover.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod provider;
pub mod resilience;

pub use config::{Config, ConfigBuilder};
pub use db::{Batch, Connection, Pool, PooledConnection, Transaction};
pub use error::{DbError, DbResult};
pub use provider::{BackendStrategy, ProviderFactory, ProviderId};
pub use resilience::{FailoverEngine, RetryEngine};
