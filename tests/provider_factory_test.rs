//! Integration tests for provider registration and dispatch.

mod common;

use common::{MockStrategy, mock_config, mock_provider};
use db_resilience::config::Config;
use db_resilience::error::{DbError, ErrorKind};
use db_resilience::models::DatabaseType;
use db_resilience::provider::{self, ProviderFactory, ProviderId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

fn factory_with_mock() -> (ProviderFactory, MockStrategy) {
    let factory = ProviderFactory::with_defaults();
    let strategy = MockStrategy::new(DatabaseType::PostgreSQL);
    factory.register(mock_provider(), Arc::new(strategy.clone()));
    (factory, strategy)
}

#[tokio::test]
async fn test_unregistered_provider_fails_without_io() {
    let (factory, strategy) = factory_with_mock();
    let mut config = mock_config();
    config.provider = ProviderId::new("cockroach");

    let err = factory.create_pool(&config).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidProvider { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(factory.create_connection(&config).await.is_err());
    assert!(factory.create_listener(&config).await.is_err());
    assert_eq!(strategy.state.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_port_zero_is_rejected_before_connecting() {
    let (factory, strategy) = factory_with_mock();
    let mut config = mock_config();
    config.port = 0;

    let err = factory.create_connection(&config).await.unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
    assert!(err.to_string().contains("port must be between 1 and 65535"));
    assert_eq!(strategy.state.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn test_validate_config_iff_required_fields() {
    let (factory, _strategy) = factory_with_mock();
    assert!(factory.validate_config(&mock_config()).is_ok());

    let mut no_user = mock_config();
    no_user.user = String::new();
    assert!(factory.validate_config(&no_user).is_err());

    let mut no_host = mock_config();
    no_host.host = "  ".to_string();
    assert!(factory.validate_config(&no_host).is_err());
}

#[tokio::test]
async fn test_registration_overwrites() {
    let (factory, first) = factory_with_mock();
    let second = MockStrategy::new(DatabaseType::PostgreSQL);

    let previous = factory.register(mock_provider(), Arc::new(second.clone()));
    assert!(previous.is_some());

    let mut conn = factory.create_connection(&mock_config()).await.unwrap();
    conn.exec("SELECT 1", &[]).await.unwrap();
    assert_eq!(first.state.opened.load(Ordering::SeqCst), 0);
    assert_eq!(second.state.opened.load(Ordering::SeqCst), 1);
    assert!(second.state.executed("SELECT 1"));
}

#[tokio::test]
async fn test_create_pool_through_factory() {
    let (factory, _strategy) = factory_with_mock();
    let pool = factory.create_pool(&mock_config()).await.unwrap();
    pool.ping(&CancellationToken::new()).await.unwrap();
    assert_eq!(pool.database_type(), DatabaseType::PostgreSQL);
    pool.close().await;
}

#[test]
fn test_create_batch_bound_to_dialect() {
    let (factory, _strategy) = factory_with_mock();
    let batch = factory.create_batch(&mock_config()).unwrap();
    assert_eq!(batch.database_type(), DatabaseType::PostgreSQL);
    assert!(batch.is_empty());

    let mysql = Config::builder(ProviderId::MYSQL)
        .host("localhost")
        .port(3306)
        .database("app")
        .user("root")
        .build();
    assert_eq!(
        factory.create_batch(&mysql).unwrap().database_type(),
        DatabaseType::MySQL
    );
}

#[tokio::test]
async fn test_listener_unsupported_for_sqlite() {
    let factory = ProviderFactory::with_defaults();
    let config = Config::builder(ProviderId::SQLITE).database(":memory:").build();
    let err = factory.create_listener(&config).await.unwrap_err();
    assert!(matches!(err, DbError::NotSupported { .. }));
}

#[test]
fn test_global_registry_replace_and_reset() {
    let custom = Arc::new(ProviderFactory::new());
    custom.register(mock_provider(), Arc::new(MockStrategy::new(DatabaseType::SQLite)));
    provider::replace_global(Arc::clone(&custom));
    assert_eq!(provider::global().providers(), vec![mock_provider()]);

    provider::reset_global();
    let defaults = provider::global().providers();
    assert!(defaults.contains(&ProviderId::POSTGRES));
    assert!(!defaults.contains(&mock_provider()));
}
