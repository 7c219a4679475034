//! Transaction state machine.
//!
//! A [`Transaction`] borrows its [`Connection`] mutably for its whole life, so
//! statements issued through it are ordered on one channel and no other work
//! can interleave. States move `Active -> Committed | RolledBack`; once
//! terminal, every operation returns [`DbError::NoTransaction`].
//!
//! Nesting is expressed only through savepoints. Savepoint names are unique
//! within a transaction and kept in creation order; re-using a name moves the
//! checkpoint, matching how the engines resolve duplicate names.

use crate::db::batch::{Batch, BatchResults};
use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{
    DatabaseType, DeferrableMode, QueryParam, Row, TransactionState, TxOptions,
    validate_identifier,
};
use tracing::{debug, info, warn};

/// Statements that open a transaction with `opts` on `db_type`.
pub(crate) fn begin_statements(db_type: DatabaseType, opts: &TxOptions) -> DbResult<Vec<String>> {
    match db_type {
        DatabaseType::PostgreSQL => {
            let mut modes = Vec::new();
            if let Some(level) = opts.isolation {
                modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
            }
            if opts.is_read_only() {
                modes.push(opts.access_mode.as_sql().to_string());
            }
            if opts.deferrable == DeferrableMode::Deferrable {
                modes.push("DEFERRABLE".to_string());
            }
            if modes.is_empty() {
                Ok(vec!["BEGIN".to_string()])
            } else {
                Ok(vec![format!("BEGIN {}", modes.join(", "))])
            }
        }
        DatabaseType::MySQL => {
            if opts.deferrable == DeferrableMode::Deferrable {
                return Err(DbError::not_supported("DEFERRABLE transactions", "MySQL"));
            }
            let mut statements = Vec::with_capacity(2);
            if let Some(level) = opts.isolation {
                statements.push(format!(
                    "SET TRANSACTION ISOLATION LEVEL {}",
                    level.as_sql()
                ));
            }
            statements.push(format!("START TRANSACTION {}", opts.access_mode.as_sql()));
            Ok(statements)
        }
        // SQLite transactions are always serializable; every requested level is satisfied.
        DatabaseType::SQLite => {
            if opts.deferrable == DeferrableMode::Deferrable {
                return Err(DbError::not_supported("DEFERRABLE transactions", "SQLite"));
            }
            let mut statements = Vec::with_capacity(2);
            if opts.is_read_only() {
                statements.push("PRAGMA query_only = ON".to_string());
            }
            statements.push("BEGIN".to_string());
            Ok(statements)
        }
    }
}

/// Session resets to run after a transaction with `opts` ends.
pub(crate) fn end_statements(db_type: DatabaseType, opts: &TxOptions) -> Vec<String> {
    match db_type {
        DatabaseType::SQLite if opts.is_read_only() => vec!["PRAGMA query_only = OFF".to_string()],
        _ => Vec::new(),
    }
}

/// An active transaction on a borrowed connection.
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    id: String,
    state: TransactionState,
    options: TxOptions,
    savepoints: Vec<String>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection_id", &self.conn.id())
            .field("state", &self.state)
            .field("savepoints", &self.savepoints)
            .finish()
    }
}

impl<'c> Transaction<'c> {
    pub(crate) fn new(conn: &'c mut Connection, options: TxOptions) -> Self {
        let id = generate_transaction_id();
        info!(
            transaction_id = %id,
            connection_id = %conn.id(),
            isolation = ?options.isolation,
            access_mode = ?options.access_mode,
            "Transaction started"
        );
        Self {
            conn,
            id,
            state: TransactionState::Active,
            options,
            savepoints: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn options(&self) -> &TxOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Savepoint names in creation order.
    pub fn savepoints(&self) -> &[String] {
        &self.savepoints
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(DbError::NoTransaction)
        }
    }

    /// Always fails: nested work uses [`Transaction::savepoint`].
    pub fn begin(&self, _opts: TxOptions) -> DbResult<()> {
        self.ensure_active()?;
        Err(DbError::InvalidNestedTransaction)
    }

    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Row> {
        self.ensure_active()?;
        self.conn.query_one(sql, params).await
    }

    pub async fn query_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        self.ensure_active()?;
        self.conn.query_optional(sql, params).await
    }

    pub async fn query_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.ensure_active()?;
        self.conn.query_all(sql, params).await
    }

    pub async fn exec(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.ensure_active()?;
        self.conn.exec(sql, params).await
    }

    /// Run a batch inside this transaction.
    pub async fn send_batch(&mut self, batch: &Batch) -> DbResult<BatchResults> {
        self.ensure_active()?;
        self.conn.send_batch(batch).await
    }

    /// Create (or move) the savepoint `name`.
    pub async fn savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        validate_identifier("Savepoint", name)?;
        self.conn.exec(&format!("SAVEPOINT {name}"), &[]).await?;
        self.savepoints.retain(|s| s != name);
        self.savepoints.push(name.to_string());
        debug!(transaction_id = %self.id, savepoint = %name, "Savepoint created");
        Ok(())
    }

    /// Undo everything since `name`; the savepoint itself survives, later ones are discarded.
    pub async fn rollback_to_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        let pos = self.savepoint_position(name)?;
        self.conn
            .exec(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
            .await?;
        self.savepoints.truncate(pos + 1);
        debug!(transaction_id = %self.id, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    /// Forget `name` and every savepoint created after it, keeping their effects.
    pub async fn release_savepoint(&mut self, name: &str) -> DbResult<()> {
        self.ensure_active()?;
        let pos = self.savepoint_position(name)?;
        self.conn
            .exec(&format!("RELEASE SAVEPOINT {name}"), &[])
            .await?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    fn savepoint_position(&self, name: &str) -> DbResult<usize> {
        self.savepoints
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| DbError::invalid_operation(format!("unknown savepoint '{name}'")))
    }

    pub async fn commit(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        let result = self.conn.finish_transaction(true).await;
        self.state = if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        };
        self.savepoints.clear();
        info!(transaction_id = %self.id, state = ?self.state, "Transaction finished");
        result
    }

    pub async fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        let result = self.conn.finish_transaction(false).await;
        if result.is_err() {
            self.conn.mark_broken();
        }
        self.state = TransactionState::RolledBack;
        self.savepoints.clear();
        info!(transaction_id = %self.id, "Transaction rolled back");
        result
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.is_active() {
            warn!(
                transaction_id = %self.id,
                connection_id = %self.conn.id(),
                "Transaction dropped while active; it will be rolled back on release or next begin"
            );
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IsolationLevel;

    #[test]
    fn test_postgres_begin_statements() {
        let plain = begin_statements(DatabaseType::PostgreSQL, &TxOptions::new()).unwrap();
        assert_eq!(plain, vec!["BEGIN"]);

        let opts = TxOptions::new()
            .isolation(IsolationLevel::Serializable)
            .read_only()
            .deferrable();
        let full = begin_statements(DatabaseType::PostgreSQL, &opts).unwrap();
        assert_eq!(
            full,
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"]
        );
    }

    #[test]
    fn test_mysql_begin_statements() {
        let opts = TxOptions::new()
            .isolation(IsolationLevel::RepeatableRead)
            .read_only();
        let statements = begin_statements(DatabaseType::MySQL, &opts).unwrap();
        assert_eq!(
            statements,
            vec![
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ",
                "START TRANSACTION READ ONLY"
            ]
        );
        let err = begin_statements(DatabaseType::MySQL, &TxOptions::new().deferrable()).unwrap_err();
        assert!(matches!(err, DbError::NotSupported { .. }));
    }

    #[test]
    fn test_sqlite_read_only_uses_query_only() {
        let opts = TxOptions::new()
            .isolation(IsolationLevel::ReadCommitted)
            .read_only();
        assert_eq!(
            begin_statements(DatabaseType::SQLite, &opts).unwrap(),
            vec!["PRAGMA query_only = ON", "BEGIN"]
        );
        assert_eq!(
            end_statements(DatabaseType::SQLite, &opts),
            vec!["PRAGMA query_only = OFF"]
        );
        assert!(end_statements(DatabaseType::PostgreSQL, &opts).is_empty());
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
    }
}
