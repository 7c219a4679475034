//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Backend adapters over sqlx connections
//! - Connections, transactions and savepoints
//! - Statement batches
//! - The connection pool
//! - Type mappings and parameter binding
//! - Notification listeners

pub mod batch;
pub mod connection;
pub mod driver;
pub mod macros;
pub mod notify;
pub(crate) mod params;
pub mod pool;
pub mod transaction;
pub mod types;

pub use batch::{Batch, BatchResults, BatchStatement};
pub use connection::Connection;
pub use driver::{BackendConnection, MySqlBackend, PostgresBackend, SqliteBackend};
pub use notify::{NotificationListener, PgNotificationListener};
pub use pool::{Pool, PoolStats, PooledConnection};
pub use transaction::Transaction;
pub use types::{RowToJson, TypeCategory, categorize_type};
