//! Backend adapter generation.
//!
//! The three sqlx drivers expose the same operations with different
//! connection, row and argument types. [`impl_sqlx_backend!`] expands one
//! adapter per driver so the forwarding code is written once and the
//! expansion stays linear to read.

/// Generate a [`BackendConnection`](crate::db::driver::BackendConnection)
/// adapter around an sqlx single connection.
///
/// # Example
///
/// ```ignore
/// impl_sqlx_backend!(
///     /// PostgreSQL adapter.
///     PostgresBackend,
///     sqlx::PgConnection,
///     DatabaseType::PostgreSQL,
///     bind_postgres_param
/// );
/// ```
#[macro_export]
macro_rules! impl_sqlx_backend {
    ($(#[$meta:meta])* $name:ident, $conn:ty, $db_type:expr, $bind:path) => {
        $(#[$meta])*
        pub struct $name {
            conn: $conn,
        }

        impl $name {
            pub fn new(conn: $conn) -> Self {
                Self { conn }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }

        #[async_trait::async_trait]
        impl $crate::db::driver::BackendConnection for $name {
            fn database_type(&self) -> $crate::models::DatabaseType {
                $db_type
            }

            async fn fetch_all(
                &mut self,
                sql: &str,
                params: &[$crate::models::QueryParam],
            ) -> $crate::error::DbResult<Vec<$crate::models::Row>> {
                use $crate::db::types::RowToJson;
                use sqlx::Executor;

                let rows = if params.is_empty() {
                    (&mut self.conn).fetch_all(sql).await?
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.fetch_all(&mut self.conn).await?
                };
                Ok(rows.iter().map(RowToJson::to_json_map).collect())
            }

            async fn fetch_optional(
                &mut self,
                sql: &str,
                params: &[$crate::models::QueryParam],
            ) -> $crate::error::DbResult<Option<$crate::models::Row>> {
                use $crate::db::types::RowToJson;
                use sqlx::Executor;

                let row = if params.is_empty() {
                    (&mut self.conn).fetch_optional(sql).await?
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.fetch_optional(&mut self.conn).await?
                };
                Ok(row.as_ref().map(RowToJson::to_json_map))
            }

            async fn execute(
                &mut self,
                sql: &str,
                params: &[$crate::models::QueryParam],
            ) -> $crate::error::DbResult<u64> {
                use sqlx::Executor;

                // Unparameterized statements go through the simple/text protocol so
                // session commands (USE, SET, SAVEPOINT, PRAGMA) are accepted.
                let result = if params.is_empty() {
                    (&mut self.conn).execute(sql).await?
                } else {
                    let mut query = sqlx::query(sql);
                    for param in params {
                        query = $bind(query, param);
                    }
                    query.execute(&mut self.conn).await?
                };
                Ok(result.rows_affected())
            }

            async fn ping(&mut self) -> $crate::error::DbResult<()> {
                sqlx::Connection::ping(&mut self.conn).await?;
                Ok(())
            }

            fn close(
                self: Box<Self>,
            ) -> futures_util::future::BoxFuture<'static, $crate::error::DbResult<()>> {
                Box::pin(async move {
                    sqlx::Connection::close(self.conn).await?;
                    Ok(())
                })
            }
        }
    };
}

pub use impl_sqlx_backend;
