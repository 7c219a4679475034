//! Provider selection.
//!
//! A provider is addressed by a [`ProviderId`] and implemented by a
//! [`BackendStrategy`]. The [`ProviderFactory`] maps identifiers to
//! strategies and is the single entry point for creating connections,
//! pools, batches and listeners from a [`Config`](crate::config::Config).

mod factory;
mod mysql;
mod postgres;
mod sqlite;
mod strategy;

pub use factory::{ProviderFactory, global, replace_global, reset_global};
pub use mysql::MySqlStrategy;
pub use postgres::PostgresStrategy;
pub use sqlite::SqliteStrategy;
pub use strategy::{BackendStrategy, validate_common};

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Identifier a strategy is registered under, e.g. `postgres`.
///
/// Identifiers are case-insensitive and stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(Cow<'static, str>);

impl ProviderId {
    pub const POSTGRES: ProviderId = ProviderId(Cow::Borrowed("postgres"));
    pub const MYSQL: ProviderId = ProviderId(Cow::Borrowed("mysql"));
    pub const SQLITE: ProviderId = ProviderId(Cow::Borrowed("sqlite"));

    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Cow::Owned(id.as_ref().trim().to_ascii_lowercase()))
    }

    /// Map a URL scheme to its provider; aliases resolve to the built-in ids.
    pub fn from_scheme(scheme: &str) -> Self {
        match scheme.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Self::POSTGRES,
            "mysql" | "mariadb" => Self::MYSQL,
            "sqlite" => Self::SQLITE,
            other => Self::new(other),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_normalizes_case() {
        assert_eq!(ProviderId::new(" Postgres "), ProviderId::POSTGRES);
        assert_eq!(ProviderId::from("SQLITE"), ProviderId::SQLITE);
    }

    #[test]
    fn test_from_scheme_aliases() {
        assert_eq!(ProviderId::from_scheme("postgresql"), ProviderId::POSTGRES);
        assert_eq!(ProviderId::from_scheme("mariadb"), ProviderId::MYSQL);
        assert_eq!(ProviderId::from_scheme("oracle").as_str(), "oracle");
    }

    #[test]
    fn test_serde_transparent() {
        let json = serde_json::to_string(&ProviderId::MYSQL).unwrap();
        assert_eq!(json, "\"mysql\"");
        let back: ProviderId = serde_json::from_str("\"mysql\"").unwrap();
        assert_eq!(back, ProviderId::MYSQL);
    }
}
