//! Error types for the data-access layer.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Variants are grouped into a small taxonomy ([`ErrorKind`]) so callers can classify
//! failures (configuration, connection, transaction misuse, no rows, duplicate key)
//! without parsing messages.

use thiserror::Error;

/// SQLSTATE / vendor codes that identify a unique-constraint violation.
///
/// - `23505`: PostgreSQL unique_violation
/// - `1062`: MySQL ER_DUP_ENTRY
/// - `2067`, `1555`: SQLite SQLITE_CONSTRAINT_UNIQUE / SQLITE_CONSTRAINT_PRIMARYKEY
const DUPLICATE_KEY_CODES: &[&str] = &["23505", "1062", "2067", "1555"];

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    #[error("Invalid provider: '{provider}' is not registered")]
    InvalidProvider { provider: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Duplicate key: {message}")]
    DuplicateKey {
        message: String,
        sql_state: Option<String>,
    },

    #[error("No rows returned")]
    NoRows,

    #[error("Nested transactions are not supported; use a savepoint instead")]
    InvalidNestedTransaction,

    #[error("No active transaction")]
    NoTransaction,

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Connection has already been released to the pool")]
    ConnectionReleased,

    #[error("{operation} is not supported by the {backend} backend")]
    NotSupported { operation: String, backend: String },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("Failover exhausted after {attempts} attempts: {source}")]
    FailoverExhausted {
        attempts: u32,
        #[source]
        source: Box<DbError>,
    },

    #[error("No healthy nodes available")]
    NoHealthyNodes,

    #[error("{operation}: {source}")]
    Operation {
        operation: String,
        #[source]
        source: Box<DbError>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or unsupported configuration. Never retried.
    Configuration,
    /// Refused, reset or timed-out connections and pool availability failures.
    Connection,
    /// Misuse of the transaction/connection state machine. Never retried.
    Transaction,
    /// Sentinel for "zero results", not a failure.
    NoRows,
    /// Unique-constraint violation reported by the backend.
    DuplicateKey,
    /// Any other error reported by the backend.
    Database,
    Cancelled,
    Unsupported,
    Internal,
}

impl DbError {
    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid provider error.
    pub fn invalid_provider(provider: impl Into<String>) -> Self {
        Self::InvalidProvider {
            provider: provider.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a duplicate key error.
    pub fn duplicate_key(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::DuplicateKey {
            message: message.into(),
            sql_state,
        }
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Create a not supported error.
    pub fn not_supported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Wrap this error with a description of the operation that failed.
    pub fn with_operation(self, operation: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through operation/retry/failover wrappers.
    pub fn root(&self) -> &DbError {
        match self {
            Self::Operation { source, .. }
            | Self::RetryExhausted { source, .. }
            | Self::FailoverExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Self::Configuration { .. } | Self::InvalidProvider { .. } | Self::InvalidInput { .. } => {
                ErrorKind::Configuration
            }
            Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::PoolClosed
            | Self::NoHealthyNodes => ErrorKind::Connection,
            Self::InvalidNestedTransaction
            | Self::NoTransaction
            | Self::InvalidOperation { .. }
            | Self::ConnectionReleased => ErrorKind::Transaction,
            Self::NoRows => ErrorKind::NoRows,
            Self::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Self::Database { .. } => ErrorKind::Database,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotSupported { .. } => ErrorKind::Unsupported,
            Self::Internal { .. } => ErrorKind::Internal,
            // root() never returns a wrapper
            Self::Operation { .. } | Self::RetryExhausted { .. } | Self::FailoverExhausted { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self.root() {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// True for the "zero results" sentinel.
    pub fn is_no_rows(&self) -> bool {
        matches!(self.root(), Self::NoRows)
    }

    /// True when the backend reported a unique-constraint violation.
    pub fn is_duplicate_key(&self) -> bool {
        match self.root() {
            Self::DuplicateKey { .. } => true,
            Self::Database {
                sql_state: Some(code),
                ..
            } => is_duplicate_key_code(code),
            _ => false,
        }
    }

    /// True when the operation was cancelled by its caller.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Whether this error carries a "temporary" signal (connection loss, timeouts).
    pub fn is_temporary(&self) -> bool {
        matches!(self.root(), Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Check a backend error code against the known unique-violation codes.
pub fn is_duplicate_key_code(code: &str) -> bool {
    DUPLICATE_KEY_CODES.contains(&code)
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let duplicate = db_err.is_unique_violation()
                    || code.as_deref().is_some_and(is_duplicate_key_code);
                if duplicate {
                    DbError::duplicate_key(db_err.message(), code)
                } else {
                    DbError::database(
                        db_err.message(),
                        code,
                        "Check the SQL syntax and referenced objects",
                    )
                }
            }
            sqlx::Error::RowNotFound => DbError::NoRows,
            sqlx::Error::PoolTimedOut => DbError::Timeout {
                operation: "connection pool acquire".to_string(),
                elapsed_ms: 0,
            },
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::internal(format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::invalid_input(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::AnyDriverError(err) => DbError::connection(
                format!("Driver error: {}", err),
                "Check database driver configuration",
            ),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
