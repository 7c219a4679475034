//! PostgreSQL strategy.

use crate::config::{Config, TlsMode};
use crate::db::{Connection, NotificationListener, PgNotificationListener, Pool, PostgresBackend};
use crate::error::DbResult;
use crate::models::DatabaseType;
use crate::provider::ProviderId;
use crate::provider::strategy::{BackendStrategy, connect};
use async_trait::async_trait;
use sqlx::Connection as _;
use sqlx::PgConnection;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions, PgSslMode};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresStrategy;

impl PostgresStrategy {
    /// Driver options for `config`. Session parameters travel in the startup packet.
    pub fn connect_options(config: &Config) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .database(&config.database)
            .ssl_mode(ssl_mode(config.tls_mode));
        if let Some(password) = &config.password {
            options = options.password(password);
        }
        if let Some(name) = &config.application_name {
            options = options.application_name(name);
        }
        if !config.session_params.is_empty() {
            options = options.options(config.session_params.iter());
        }
        options
    }
}

fn ssl_mode(mode: TlsMode) -> PgSslMode {
    match mode {
        TlsMode::Disable => PgSslMode::Disable,
        TlsMode::Require => PgSslMode::Require,
        TlsMode::VerifyCa => PgSslMode::VerifyCa,
        TlsMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl BackendStrategy for PostgresStrategy {
    fn provider(&self) -> ProviderId {
        ProviderId::POSTGRES
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    async fn create_connection(&self, config: &Config) -> DbResult<Connection> {
        let options = Self::connect_options(config);
        let conn = connect(
            DatabaseType::PostgreSQL,
            config,
            PgConnection::connect_with(&options),
        )
        .await?;
        Ok(Connection::new(Box::new(PostgresBackend::new(conn)), config))
    }

    async fn create_pool(&self, config: &Config) -> DbResult<Pool> {
        self.validate_config(config)?;
        Pool::connect(Arc::new(*self), Arc::new(config.clone())).await
    }

    async fn create_listener(&self, config: &Config) -> DbResult<Box<dyn NotificationListener>> {
        let options = Self::connect_options(config);
        let pool = connect(
            DatabaseType::PostgreSQL,
            config,
            PgPoolOptions::new().max_connections(1).connect_with(options),
        )
        .await?;
        let listener = connect(DatabaseType::PostgreSQL, config, PgListener::connect_with(&pool)).await?;
        Ok(Box::new(PgNotificationListener::new(listener)))
    }
}
