//! SQLite strategy.
//!
//! SQLite is embedded: only the database path matters, so the network
//! checks of [`validate_common`](super::validate_common) do not apply.
//! Each `:memory:` connection is its own private database.

use crate::config::Config;
use crate::db::{Connection, Pool, SqliteBackend};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use crate::provider::ProviderId;
use crate::provider::strategy::{BackendStrategy, apply_session_params, connect, validate_shared};
use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::SqliteConnection;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;

const MEMORY_DATABASE: &str = ":memory:";

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteStrategy;

impl SqliteStrategy {
    pub fn connect_options(config: &Config) -> DbResult<SqliteConnectOptions> {
        if config.database == MEMORY_DATABASE {
            return SqliteConnectOptions::from_str("sqlite::memory:").map_err(DbError::from);
        }
        Ok(SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true))
    }
}

#[async_trait]
impl BackendStrategy for SqliteStrategy {
    fn provider(&self) -> ProviderId {
        ProviderId::SQLITE
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn validate_config(&self, config: &Config) -> DbResult<()> {
        if config.database.trim().is_empty() {
            return Err(DbError::configuration("database path cannot be empty"));
        }
        if config.multi_tenant {
            return Err(DbError::configuration(
                "multi-tenancy is not supported by the SQLite backend",
            ));
        }
        validate_shared(config)
    }

    async fn create_connection(&self, config: &Config) -> DbResult<Connection> {
        let options = Self::connect_options(config)?;
        let conn = connect(
            DatabaseType::SQLite,
            config,
            SqliteConnection::connect_with(&options),
        )
        .await?;
        let conn = Connection::new(Box::new(SqliteBackend::new(conn)), config);
        apply_session_params(conn, config).await
    }

    async fn create_pool(&self, config: &Config) -> DbResult<Pool> {
        self.validate_config(config)?;
        Pool::connect(Arc::new(*self), Arc::new(config.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryParam;

    #[test]
    fn test_validation_needs_only_path() {
        let config = Config::builder(ProviderId::SQLITE).database("app.db").build();
        assert!(SqliteStrategy.validate_config(&config).is_ok());

        let empty = Config::builder(ProviderId::SQLITE).build();
        assert!(SqliteStrategy.validate_config(&empty).is_err());

        let tenants = Config::builder(ProviderId::SQLITE)
            .database("app.db")
            .multi_tenant(true)
            .build();
        assert!(SqliteStrategy.validate_config(&tenants).is_err());
    }

    #[tokio::test]
    async fn test_create_connection_applies_pragmas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pragma.db");
        let config = Config::builder(ProviderId::SQLITE)
            .database(path.to_string_lossy())
            .session_param("foreign_keys", "ON")
            .build();

        let mut conn = SqliteStrategy.create_connection(&config).await.unwrap();
        let row = conn.query_one("PRAGMA foreign_keys", &[]).await.unwrap();
        assert_eq!(row["foreign_keys"], 1);

        conn.exec("CREATE TABLE t (v INTEGER)", &[]).await.unwrap();
        conn.exec("INSERT INTO t VALUES (?)", &[QueryParam::Int(7)])
            .await
            .unwrap();
        conn.close().await.unwrap();
        assert!(path.exists());
    }
}
