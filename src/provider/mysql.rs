//! MySQL / MariaDB strategy.

use crate::config::{Config, TlsMode};
use crate::db::{Connection, MySqlBackend, Pool};
use crate::error::DbResult;
use crate::models::DatabaseType;
use crate::provider::ProviderId;
use crate::provider::strategy::{BackendStrategy, apply_session_params, connect};
use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::MySqlConnection;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlStrategy;

impl MySqlStrategy {
    pub fn connect_options(config: &Config) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .ssl_mode(ssl_mode(config.tls_mode))
            .charset("utf8mb4");
        if !config.database.is_empty() {
            options = options.database(&config.database);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        options
    }
}

fn ssl_mode(mode: TlsMode) -> MySqlSslMode {
    match mode {
        TlsMode::Disable => MySqlSslMode::Disabled,
        TlsMode::Require => MySqlSslMode::Required,
        TlsMode::VerifyCa => MySqlSslMode::VerifyCa,
        TlsMode::VerifyFull => MySqlSslMode::VerifyIdentity,
    }
}

#[async_trait]
impl BackendStrategy for MySqlStrategy {
    fn provider(&self) -> ProviderId {
        ProviderId::MYSQL
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn create_connection(&self, config: &Config) -> DbResult<Connection> {
        let options = Self::connect_options(config);
        let conn = connect(
            DatabaseType::MySQL,
            config,
            MySqlConnection::connect_with(&options),
        )
        .await?;
        let conn = Connection::new(Box::new(MySqlBackend::new(conn)), config);
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
    use crate::error::DbError;

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(TlsMode::Require), MySqlSslMode::Required));
        assert!(matches!(ssl_mode(TlsMode::VerifyFull), MySqlSslMode::VerifyIdentity));
    }

    #[tokio::test]
    async fn test_listener_not_supported() {
        let config = Config::builder(ProviderId::MYSQL).build();
        let err = MySqlStrategy.create_listener(&config).await.unwrap_err();
        assert!(matches!(err, DbError::NotSupported { .. }));
    }
}
