//! Backend strategy contract and the helpers the built-in strategies share.

use crate::config::Config;
use crate::db::{Batch, Connection, NotificationListener, Pool};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, validate_identifier};
use crate::provider::ProviderId;
use async_trait::async_trait;
use std::future::Future;
use tracing::debug;

/// Per-backend creation and validation logic.
///
/// Strategies are stateless; everything they need comes from the
/// [`Config`] passed to each call.
#[async_trait]
pub trait BackendStrategy: Send + Sync + std::fmt::Debug {
    /// Identifier this strategy registers under by default.
    fn provider(&self) -> ProviderId;

    fn database_type(&self) -> DatabaseType;

    /// Reject configurations this backend cannot use, before any I/O.
    fn validate_config(&self, config: &Config) -> DbResult<()> {
        validate_common(config)
    }

    /// Open one standalone connection with session parameters applied.
    async fn create_connection(&self, config: &Config) -> DbResult<Connection>;

    /// Create a pool whose connections come from this strategy.
    async fn create_pool(&self, config: &Config) -> DbResult<Pool>;

    /// An empty batch in this backend's dialect.
    fn create_batch(&self) -> Batch {
        Batch::new(self.database_type())
    }

    /// Open a notification listener on a dedicated connection.
    async fn create_listener(&self, _config: &Config) -> DbResult<Box<dyn NotificationListener>> {
        Err(DbError::not_supported(
            "notifications",
            self.database_type().to_string(),
        ))
    }
}

/// Validation shared by the network backends.
pub fn validate_common(config: &Config) -> DbResult<()> {
    if config.host.trim().is_empty() {
        return Err(DbError::configuration("host cannot be empty"));
    }
    if config.port == 0 {
        return Err(DbError::configuration("port must be between 1 and 65535"));
    }
    if config.database.trim().is_empty() {
        return Err(DbError::configuration("database cannot be empty"));
    }
    if config.user.trim().is_empty() {
        return Err(DbError::configuration("user cannot be empty"));
    }
    validate_shared(config)
}

/// Checks that apply to every backend, embedded or not.
pub(crate) fn validate_shared(config: &Config) -> DbResult<()> {
    config.pool.validate().map_err(DbError::configuration)?;
    for key in config.session_params.keys() {
        validate_identifier("Session parameter", key)
            .map_err(|e| DbError::configuration(e.to_string()))?;
    }
    Ok(())
}

/// Await a driver connect future under `config.connect_timeout` (zero disables it).
pub(crate) async fn connect<T, F>(db_type: DatabaseType, config: &Config, fut: F) -> DbResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let outcome = if config.connect_timeout.is_zero() {
        fut.await
    } else {
        match tokio::time::timeout(config.connect_timeout, fut).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(DbError::timeout("connect", config.connect_timeout)),
        }
    };

    match outcome {
        Ok(conn) => Ok(conn),
        // The server answered (bad credentials, unknown database): not a transient failure.
        Err(e @ sqlx::Error::Database(_)) => Err(DbError::from(e)),
        Err(e) => {
            let suggestion = connection_suggestion(db_type, &e);
            Err(DbError::connection(e.to_string(), suggestion))
        }
    }
}

/// Run the session-parameter statements on a fresh connection; close it on failure.
pub(crate) async fn apply_session_params(
    mut conn: Connection,
    config: &Config,
) -> DbResult<Connection> {
    let statements = session_statements(conn.database_type(), config);
    if statements.is_empty() {
        return Ok(conn);
    }
    match conn.exec_script(&statements).await {
        Ok(()) => {
            debug!(connection_id = %conn.id(), count = statements.len(), "Session parameters applied");
            Ok(conn)
        }
        Err(e) => {
            let _ = conn.close().await;
            Err(e.with_operation("apply session parameters"))
        }
    }
}

/// Statements that set `config.session_params` on a new session.
///
/// PostgreSQL receives them in the startup packet instead, so none are produced.
pub(crate) fn session_statements(db_type: DatabaseType, config: &Config) -> Vec<String> {
    let render = |key: &str, value: &str| {
        let value = session_value(value);
        match db_type {
            DatabaseType::PostgreSQL => None,
            DatabaseType::MySQL => Some(format!("SET SESSION {key} = {value}")),
            DatabaseType::SQLite => Some(format!("PRAGMA {key} = {value}")),
        }
    };
    config
        .session_params
        .iter()
        .filter_map(|(k, v)| render(k, v))
        .collect()
}

/// Numbers and bare keywords pass through; anything else becomes a quoted literal.
fn session_value(value: &str) -> String {
    let is_number = value.parse::<f64>().is_ok();
    let is_keyword = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphabetic() || c == '_');
    if is_number || is_keyword {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// Generate helpful suggestions based on connection error type.
fn connection_suggestion(db_type: DatabaseType, error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") {
        return format!("Check that the {db_type} server is running and accessible");
    }
    if error_str.contains("authentication") || error_str.contains("password") {
        return "Verify the user and password in the configuration".to_string();
    }
    if error_str.contains("does not exist") || error_str.contains("unknown database") {
        return "Check that the database name exists".to_string();
    }
    if error_str.contains("tls") || error_str.contains("ssl") {
        return "Check the TLS mode or try tls_mode=disable".to_string();
    }
    if error_str.contains("unable to open database file") {
        return "Check that the directory of the SQLite file exists and is writable".to_string();
    }

    match db_type {
        DatabaseType::PostgreSQL | DatabaseType::MySQL => {
            "Verify host, port and that the server accepts network connections".to_string()
        }
        DatabaseType::SQLite => "Verify the database file path".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn valid() -> Config {
        Config::builder(ProviderId::POSTGRES)
            .host("localhost")
            .port(5432)
            .database("app")
            .user("app")
            .build()
    }

    #[test]
    fn test_validate_common_accepts_complete_config() {
        assert!(validate_common(&valid()).is_ok());
    }

    #[test]
    fn test_validate_common_port_zero() {
        let mut config = valid();
        config.port = 0;
        let err = validate_common(&config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("port must be between 1 and 65535"));
    }

    #[test]
    fn test_validate_common_requires_fields() {
        for field in ["host", "database", "user"] {
            let mut config = valid();
            match field {
                "host" => config.host.clear(),
                "database" => config.database.clear(),
                _ => config.user.clear(),
            }
            let err = validate_common(&config).unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn test_validate_common_pool_bounds() {
        let config = Config::builder(ProviderId::POSTGRES)
            .host("localhost")
            .port(5432)
            .database("app")
            .user("app")
            .max_connections(2)
            .min_connections(5)
            .build();
        assert!(validate_common(&config).is_err());

        // max of zero means "default", so any min is allowed
        let mut unbounded = config.clone();
        unbounded.pool.max_connections = Some(0);
        assert!(validate_common(&unbounded).is_ok());
    }

    #[test]
    fn test_session_param_keys_are_identifiers() {
        let mut config = valid();
        config
            .session_params
            .insert("statement_timeout; DROP".to_string(), "1".to_string());
        assert!(validate_common(&config).is_err());
    }

    #[test]
    fn test_session_statements_per_backend() {
        let config = Config::builder(ProviderId::MYSQL)
            .session_param("sql_mode", "ANSI_QUOTES,STRICT_ALL_TABLES")
            .session_param("wait_timeout", "60")
            .build();
        assert_eq!(
            session_statements(DatabaseType::MySQL, &config),
            vec![
                "SET SESSION sql_mode = 'ANSI_QUOTES,STRICT_ALL_TABLES'",
                "SET SESSION wait_timeout = 60",
            ]
        );
        assert!(session_statements(DatabaseType::PostgreSQL, &config).is_empty());

        let sqlite = Config::builder(ProviderId::SQLITE)
            .session_param("journal_mode", "WAL")
            .build();
        assert_eq!(
            session_statements(DatabaseType::SQLite, &sqlite),
            vec!["PRAGMA journal_mode = WAL"]
        );
    }

    #[test]
    fn test_session_value_quotes_strings() {
        assert_eq!(session_value("it's"), "'it''s'");
        assert_eq!(session_value("2.5"), "2.5");
        assert_eq!(session_value(""), "''");
    }
}
