//! Shared test helpers: an in-process backend that records every statement.

#![allow(dead_code)]

use async_trait::async_trait;
use db_resilience::config::Config;
use db_resilience::db::{BackendConnection, Connection, Pool};
use db_resilience::error::{DbError, DbResult};
use db_resilience::models::{DatabaseType, QueryParam, Row};
use db_resilience::provider::{BackendStrategy, ProviderId};
use futures_util::future::BoxFuture;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// State shared by a mock strategy and every connection it opens.
#[derive(Debug, Default)]
pub struct MockState {
    pub statements: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    /// Hosts whose connects and statements fail with a connection error
    pub down_hosts: Mutex<HashSet<String>>,
    /// Statements containing this text fail with a database error
    pub failing_sql: Mutex<Option<String>>,
    pub ping_fails: AtomicBool,
}

impl MockState {
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn clear_statements(&self) {
        self.statements.lock().unwrap().clear();
    }

    pub fn executed(&self, sql: &str) -> bool {
        self.statements().iter().any(|s| s == sql)
    }

    pub fn set_down(&self, host: &str, down: bool) {
        let mut hosts = self.down_hosts.lock().unwrap();
        if down {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn fail_on(&self, sql: Option<&str>) {
        *self.failing_sql.lock().unwrap() = sql.map(String::from);
    }

    fn is_down(&self, host: &str) -> bool {
        self.down_hosts.lock().unwrap().contains(host)
    }
}

#[derive(Debug)]
pub struct MockBackend {
    state: Arc<MockState>,
    host: String,
    db_type: DatabaseType,
}

impl MockBackend {
    fn run(&self, sql: &str) -> DbResult<()> {
        if self.state.is_down(&self.host) {
            return Err(DbError::connection("connection reset by peer", "node is down"));
        }
        self.state.statements.lock().unwrap().push(sql.to_string());
        let failing = self.state.failing_sql.lock().unwrap().clone();
        match failing {
            Some(fragment) if sql.contains(&fragment) => Err(DbError::database(
                format!("statement failed: {sql}"),
                Some("42000".to_string()),
                "check the statement",
            )),
            _ => Ok(()),
        }
    }

    fn row(&self, sql: &str) -> Option<Row> {
        if sql.contains("EMPTY") {
            return None;
        }
        let mut row = Row::new();
        row.insert("host".to_string(), self.host.clone().into());
        row.insert("value".to_string(), 1.into());
        Some(row)
    }
}

#[async_trait]
impl BackendConnection for MockBackend {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn fetch_all(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.run(sql)?;
        Ok(self.row(sql).into_iter().collect())
    }

    async fn fetch_optional(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<Option<Row>> {
        self.run(sql)?;
        Ok(self.row(sql))
    }

    async fn execute(&mut self, sql: &str, _params: &[QueryParam]) -> DbResult<u64> {
        self.run(sql)?;
        Ok(1)
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.state.is_down(&self.host) || self.state.ping_fails.load(Ordering::SeqCst) {
            return Err(DbError::connection("connection refused", "node is down"));
        }
        Ok(())
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Strategy producing [`MockBackend`] connections in a chosen dialect.
#[derive(Debug, Clone)]
pub struct MockStrategy {
    pub state: Arc<MockState>,
    pub db_type: DatabaseType,
}

impl MockStrategy {
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            state: Arc::new(MockState::default()),
            db_type,
        }
    }
}

#[async_trait]
impl BackendStrategy for MockStrategy {
    fn provider(&self) -> ProviderId {
        mock_provider()
    }

    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn create_connection(&self, config: &Config) -> DbResult<Connection> {
        if self.state.is_down(&config.host) {
            return Err(DbError::connection(
                format!("connection refused ({})", config.host),
                "node is down",
            ));
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let backend = MockBackend {
            state: Arc::clone(&self.state),
            host: config.host.clone(),
            db_type: self.db_type,
        };
        Ok(Connection::new(Box::new(backend), config))
    }

    async fn create_pool(&self, config: &Config) -> DbResult<Pool> {
        self.validate_config(config)?;
        Pool::connect(Arc::new(self.clone()), Arc::new(config.clone())).await
    }
}

pub fn mock_provider() -> ProviderId {
    ProviderId::new("mock")
}

/// A valid network-style configuration for the mock provider.
pub fn mock_config() -> Config {
    Config::builder(mock_provider())
        .host("primary")
        .port(5432)
        .database("app")
        .user("app")
        .max_connections(2)
        .health_check_period(Duration::ZERO)
        .query_timeout(Duration::from_secs(5))
        .build()
}

/// Mock strategy plus a pool over it.
pub async fn mock_pool(config: Config) -> (MockStrategy, Pool) {
    let strategy = MockStrategy::new(DatabaseType::PostgreSQL);
    let pool = strategy.create_pool(&config).await.unwrap();
    (strategy, pool)
}

/// Poll `check` until it holds or one second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
