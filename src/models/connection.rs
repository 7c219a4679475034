//! Connection-related data models.
//!
//! This module defines the backend type, tenant identifiers and notification payloads.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};

/// Maximum length of an unquoted identifier accepted for tenants and savepoints.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::MySQL => Some(3306),
            Self::SQLite => None,
        }
    }

    /// Whether the backend supports `LISTEN`/`NOTIFY` style notifications.
    pub fn supports_notifications(&self) -> bool {
        matches!(self, Self::PostgreSQL)
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Validate an SQL identifier used unquoted or quoted by this crate.
///
/// Accepts ASCII letters, digits and `_`, not starting with a digit,
/// at most [`MAX_IDENTIFIER_LEN`] bytes.
pub fn validate_identifier(kind: &str, name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::invalid_input(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(DbError::invalid_input(format!(
            "{kind} name '{name}' exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(DbError::invalid_input(format!(
            "{kind} name '{name}' cannot start with a digit"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::invalid_input(format!(
            "{kind} name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Tenant scope applied to a leased connection.
///
/// On PostgreSQL the tenant names a schema placed on the `search_path`;
/// on MySQL it names the database selected with `USE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> DbResult<Self> {
        let id = id.into();
        validate_identifier("Tenant", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = DbError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message delivered on a notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Backend process id of the sender.
    pub process_id: u32,
}
