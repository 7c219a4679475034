//! Logical database connection.
//!
//! A [`Connection`] wraps one backend channel and adds what every backend
//! shares: per-statement timeouts, transaction bookkeeping, tenant scope and
//! the "broken" flag the pool uses to decide whether a channel can be reused.

use crate::config::Config;
use crate::db::batch::{Batch, BatchResults};
use crate::db::driver::BackendConnection;
use crate::db::transaction::{self, Transaction};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{DatabaseType, QueryParam, Row, TenantId, TxOptions};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct Connection {
    id: String,
    backend: Box<dyn BackendConnection>,
    query_timeout: Duration,
    /// Database selected at connect time; restored when a MySQL tenant is cleared.
    home_database: String,
    created_at: Instant,
    last_used: Instant,
    /// Options of the transaction currently open on the channel, if any.
    open_transaction: Option<TxOptions>,
    tenant: Option<TenantId>,
    broken: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("database_type", &self.database_type())
            .field("in_transaction", &self.in_transaction())
            .field("tenant", &self.tenant)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Run `fut` under `limit`; a zero limit disables the bound.
async fn bounded<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

impl Connection {
    /// Wrap an opened backend channel.
    pub fn new(backend: Box<dyn BackendConnection>, config: &Config) -> Self {
        let now = Instant::now();
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4().simple()),
            backend,
            query_timeout: config.query_timeout,
            home_database: config.database.clone(),
            created_at: now,
            last_used: now,
            open_transaction: None,
            tenant: None,
            broken: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn database_type(&self) -> DatabaseType {
        self.backend.database_type()
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    /// True while a transaction begun on this connection has not ended.
    pub fn in_transaction(&self) -> bool {
        self.open_transaction.is_some()
    }

    /// True after a timeout or connection-level failure; the pool destroys broken connections.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Record the outcome of a backend call, flagging the channel on connection-level failure.
    fn settle<T>(&mut self, operation: &str, outcome: Option<DbResult<T>>) -> DbResult<T> {
        self.last_used = Instant::now();
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => {
                if err.kind() == ErrorKind::Connection {
                    self.broken = true;
                }
                Err(err)
            }
            None => {
                self.broken = true;
                Err(DbError::timeout(operation, self.query_timeout))
            }
        }
    }

    /// Fetch exactly one row; [`DbError::NoRows`] when the result is empty.
    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Row> {
        self.query_optional(sql, params)
            .await?
            .ok_or(DbError::NoRows)
    }

    pub async fn query_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        let outcome = bounded(self.query_timeout, self.backend.fetch_optional(sql, params)).await;
        self.settle("query", outcome)
    }

    pub async fn query_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let outcome = bounded(self.query_timeout, self.backend.fetch_all(sql, params)).await;
        self.settle("query", outcome)
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn exec(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        let outcome = bounded(self.query_timeout, self.backend.execute(sql, params)).await;
        self.settle("exec", outcome)
    }

    /// Execute a sequence of unparameterized statements, stopping at the first failure.
    pub(crate) async fn exec_script(&mut self, statements: &[String]) -> DbResult<()> {
        for sql in statements {
            debug!(connection_id = %self.id, sql = %sql, "Executing control statement");
            self.exec(sql, &[]).await?;
        }
        Ok(())
    }

    /// Run every statement of `batch` in order.
    ///
    /// Outside a transaction the batch is wrapped in one so it applies atomically.
    pub async fn send_batch(&mut self, batch: &Batch) -> DbResult<BatchResults> {
        if batch.database_type() != self.database_type() {
            return Err(DbError::invalid_input(format!(
                "batch built for {} cannot run on a {} connection",
                batch.database_type(),
                self.database_type()
            )));
        }
        if batch.is_empty() {
            return Ok(BatchResults::default());
        }

        let owns_transaction = !self.in_transaction();
        if owns_transaction {
            self.start_transaction(TxOptions::default()).await?;
        }

        let mut results = BatchResults::default();
        for (index, statement) in batch.statements().iter().enumerate() {
            match self.exec(&statement.sql, &statement.params).await {
                Ok(affected) => results.rows_affected.push(affected),
                Err(err) => {
                    if owns_transaction {
                        if let Err(rollback_err) = self.rollback_open_transaction().await {
                            warn!(connection_id = %self.id, error = %rollback_err, "Batch rollback failed");
                        }
                    }
                    return Err(err.with_operation(format!("batch statement {index}")));
                }
            }
        }

        if owns_transaction {
            self.finish_transaction(true).await?;
        }
        Ok(results)
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        let outcome = bounded(self.query_timeout, self.backend.ping()).await;
        self.settle("ping", outcome)
    }

    /// Begin a transaction with the given options.
    ///
    /// If a previous [`Transaction`] was dropped without commit or rollback, its
    /// open transaction is rolled back before the new one starts.
    pub async fn begin(&mut self, opts: TxOptions) -> DbResult<Transaction<'_>> {
        if self.in_transaction() {
            warn!(connection_id = %self.id, "Rolling back stale transaction before begin");
            self.rollback_open_transaction().await?;
        }
        self.start_transaction(opts).await?;
        Ok(Transaction::new(self, opts))
    }

    async fn start_transaction(&mut self, opts: TxOptions) -> DbResult<()> {
        let statements = transaction::begin_statements(self.database_type(), &opts)?;
        if let Err(err) = self.exec_script(&statements).await {
            // A partially applied begin (e.g. SQLite query_only) must not leak.
            let _ = self
                .exec_script(&transaction::end_statements(self.database_type(), &opts))
                .await;
            return Err(err);
        }
        self.open_transaction = Some(opts);
        Ok(())
    }

    /// Commit or roll back the open transaction and restore session state.
    pub(crate) async fn finish_transaction(&mut self, commit: bool) -> DbResult<()> {
        let Some(opts) = self.open_transaction else {
            return Err(DbError::NoTransaction);
        };
        let db_type = self.database_type();
        let verb = if commit { "COMMIT" } else { "ROLLBACK" };
        let result = self.exec(verb, &[]).await;
        if result.is_err() && commit {
            // A failed COMMIT leaves the server transaction aborted or unknown.
            let _ = self.exec("ROLLBACK", &[]).await;
        }
        self.open_transaction = None;
        let reset = self
            .exec_script(&transaction::end_statements(db_type, &opts))
            .await;
        result?;
        reset
    }

    /// Roll back whatever transaction is open on the channel, if any.
    pub(crate) async fn rollback_open_transaction(&mut self) -> DbResult<()> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.finish_transaction(false).await
    }

    /// Scope the session to `tenant`.
    pub async fn set_tenant(&mut self, tenant: &TenantId) -> DbResult<()> {
        let sql = match self.database_type() {
            DatabaseType::PostgreSQL => format!("SET search_path TO \"{}\"", tenant.as_str()),
            DatabaseType::MySQL => format!("USE `{}`", tenant.as_str()),
            DatabaseType::SQLite => {
                return Err(DbError::not_supported("multi-tenancy", DatabaseType::SQLite.to_string()));
            }
        };
        self.exec(&sql, &[]).await?;
        debug!(connection_id = %self.id, tenant = %tenant, "Tenant scope applied");
        self.tenant = Some(tenant.clone());
        Ok(())
    }

    /// Remove any tenant scope so the connection can be reused by another tenant.
    pub async fn clear_tenant(&mut self) -> DbResult<()> {
        if self.tenant.is_none() {
            return Ok(());
        }
        match self.database_type() {
            DatabaseType::PostgreSQL => {
                self.exec("RESET search_path", &[]).await?;
            }
            // MySQL cannot deselect a database; without a home database the channel is retired.
            DatabaseType::MySQL if self.home_database.is_empty() => self.broken = true,
            DatabaseType::MySQL => {
                let sql = format!("USE `{}`", self.home_database.replace('`', "``"));
                self.exec(&sql, &[]).await?;
            }
            DatabaseType::SQLite => {}
        }
        self.tenant = None;
        Ok(())
    }

    /// Close the channel. An open transaction is discarded by the server.
    pub async fn close(self) -> DbResult<()> {
        debug!(connection_id = %self.id, "Closing connection");
        self.backend.close().await
    }
}
