//! Backend driver capability.
//!
//! Every backend plugs in below [`Connection`](crate::db::Connection) by
//! implementing [`BackendConnection`]. The adapter is chosen once when the
//! connection is opened; nothing above this layer branches per backend
//! except for dialect SQL.

use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::error::DbResult;
use crate::impl_sqlx_backend;
use crate::models::{DatabaseType, QueryParam, Row};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// A single live channel to a database server.
#[async_trait]
pub trait BackendConnection: Send + std::fmt::Debug {
    /// Dialect spoken by this connection.
    fn database_type(&self) -> DatabaseType;

    async fn fetch_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>>;

    async fn fetch_optional(&mut self, sql: &str, params: &[QueryParam])
    -> DbResult<Option<Row>>;

    /// Run a statement and return the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64>;

    async fn ping(&mut self) -> DbResult<()>;

    /// Gracefully terminate the channel.
    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>>;
}

impl_sqlx_backend!(
    /// PostgreSQL adapter over `sqlx::PgConnection`.
    PostgresBackend,
    sqlx::PgConnection,
    DatabaseType::PostgreSQL,
    bind_postgres_param
);

impl_sqlx_backend!(
    /// MySQL/MariaDB adapter over `sqlx::MySqlConnection`.
    MySqlBackend,
    sqlx::MySqlConnection,
    DatabaseType::MySQL,
    bind_mysql_param
);

impl_sqlx_backend!(
    /// SQLite adapter over `sqlx::SqliteConnection`.
    SqliteBackend,
    sqlx::SqliteConnection,
    DatabaseType::SQLite,
    bind_sqlite_param
);

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection as _;

    async fn memory_backend() -> SqliteBackend {
        let conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteBackend::new(conn)
    }

    #[tokio::test]
    async fn test_sqlite_backend_roundtrip() {
        let mut backend = memory_backend().await;
        assert_eq!(backend.database_type(), DatabaseType::SQLite);

        backend
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB)", &[])
            .await
            .unwrap();
        let affected = backend
            .execute(
                "INSERT INTO t (name, data) VALUES (?, ?)",
                &[QueryParam::from("alice"), QueryParam::Bytes(vec![1, 2, 3])],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = backend
            .fetch_all("SELECT id, name, data FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[0]["name"], "alice");
        assert_eq!(rows[0]["data"], "AQID");

        let missing = backend
            .fetch_optional("SELECT name FROM t WHERE id = ?", &[QueryParam::Int(99)])
            .await
            .unwrap();
        assert!(missing.is_none());

        backend.ping().await.unwrap();
        Box::new(backend).close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_backend_null_and_expression_columns() {
        let mut backend = memory_backend().await;
        let row = backend
            .fetch_optional("SELECT NULL AS nothing, 1 + 1 AS two, 'x' AS letter", &[])
            .await
            .unwrap()
            .unwrap();
        assert!(row["nothing"].is_null());
        assert_eq!(row["two"], 2);
        assert_eq!(row["letter"], "x");
    }
}
