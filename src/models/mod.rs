//! Data models shared by the pool, transaction and resilience layers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod transaction;

// Re-export commonly used types
pub use connection::{
    DatabaseType, MAX_IDENTIFIER_LEN, Notification, TenantId, validate_identifier,
};
pub use query::{QueryParam, Row};
pub use transaction::{AccessMode, DeferrableMode, IsolationLevel, TransactionState, TxOptions};
