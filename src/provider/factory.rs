//! Provider registry.

use crate::config::Config;
use crate::db::{Batch, Connection, NotificationListener, Pool};
use crate::error::{DbError, DbResult};
use crate::provider::{
    BackendStrategy, MySqlStrategy, PostgresStrategy, ProviderId, SqliteStrategy,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Registry from [`ProviderId`] to [`BackendStrategy`].
///
/// Lookups clone the strategy `Arc` and drop the lock before any I/O.
#[derive(Default)]
pub struct ProviderFactory {
    strategies: RwLock<HashMap<ProviderId, Arc<dyn BackendStrategy>>>,
}

impl std::fmt::Debug for ProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderFactory")
            .field("providers", &self.providers())
            .finish()
    }
}

impl ProviderFactory {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the PostgreSQL, MySQL and SQLite strategies.
    pub fn with_defaults() -> Self {
        let factory = Self::new();
        factory.register(ProviderId::POSTGRES, Arc::new(PostgresStrategy));
        factory.register(ProviderId::MYSQL, Arc::new(MySqlStrategy));
        factory.register(ProviderId::SQLITE, Arc::new(SqliteStrategy));
        factory
    }

    /// Register `strategy` under `id`, returning any strategy it replaced.
    pub fn register(
        &self,
        id: ProviderId,
        strategy: Arc<dyn BackendStrategy>,
    ) -> Option<Arc<dyn BackendStrategy>> {
        let previous = self
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), strategy);
        if previous.is_some() {
            debug!(provider = %id, "Replaced registered strategy");
        } else {
            debug!(provider = %id, "Registered strategy");
        }
        previous
    }

    pub fn unregister(&self, id: &ProviderId) -> Option<Arc<dyn BackendStrategy>> {
        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Look up the strategy for `id`.
    pub fn strategy(&self, id: &ProviderId) -> DbResult<Arc<dyn BackendStrategy>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::invalid_provider(id.as_str()))
    }

    /// Registered identifiers, sorted.
    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn resolve(&self, config: &Config) -> DbResult<Arc<dyn BackendStrategy>> {
        let strategy = self.strategy(&config.provider)?;
        strategy.validate_config(config)?;
        Ok(strategy)
    }

    pub fn validate_config(&self, config: &Config) -> DbResult<()> {
        self.resolve(config).map(|_| ())
    }

    pub async fn create_connection(&self, config: &Config) -> DbResult<Connection> {
        self.resolve(config)?.create_connection(config).await
    }

    pub async fn create_pool(&self, config: &Config) -> DbResult<Pool> {
        self.resolve(config)?.create_pool(config).await
    }

    pub fn create_batch(&self, config: &Config) -> DbResult<Batch> {
        Ok(self.resolve(config)?.create_batch())
    }

    pub async fn create_listener(
        &self,
        config: &Config,
    ) -> DbResult<Box<dyn NotificationListener>> {
        self.resolve(config)?.create_listener(config).await
    }
}

static GLOBAL: RwLock<Option<Arc<ProviderFactory>>> = RwLock::new(None);

/// The process-wide factory, installed with the default strategies on first use.
pub fn global() -> Arc<ProviderFactory> {
    if let Some(factory) = GLOBAL.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
        return Arc::clone(factory);
    }
    let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Arc::new(ProviderFactory::with_defaults())))
}

/// Install `factory` as the process-wide factory, returning the previous one.
pub fn replace_global(factory: Arc<ProviderFactory>) -> Option<Arc<ProviderFactory>> {
    GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .replace(factory)
}

/// Drop the process-wide factory; the next [`global`] call installs a fresh default one.
pub fn reset_global() {
    GLOBAL.write().unwrap_or_else(PoisonError::into_inner).take();
}
