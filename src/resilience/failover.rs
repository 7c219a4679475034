//! Failover engine: node health tracking and fallback routing.
//!
//! # Design Decisions
//!
//! - **Ordered health map**: nodes keep their configured order, so the first
//!   healthy node is always the preferred one.
//! - **`OnceCell` per node**: pools are created lazily and single-flight;
//!   concurrent callers routed to the same node wait for one creation.
//! - **Eviction on node failure**: a node marked down loses its pool, so a
//!   recovered node starts with fresh connections.
//! - **Weak health checker**: the background task ends once the engine is
//!   dropped.

use crate::config::{Config, FailoverPolicy, split_node};
use crate::db::Pool;
use crate::error::{DbError, DbResult};
use crate::provider::ProviderFactory;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    /// Routing attempts across all `execute` calls
    pub total_failover_attempts: u64,
    /// Attempts that ended in a node-level failure
    pub failed_failover_attempts: u64,
    pub down_nodes: Vec<String>,
}

pub struct FailoverEngine {
    factory: Arc<ProviderFactory>,
    config: Config,
    policy: FailoverPolicy,
    health: RwLock<Vec<(String, bool)>>,
    pools: TokioRwLock<HashMap<String, Arc<OnceCell<Pool>>>>,
    total_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for FailoverEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverEngine")
            .field("url", &self.config.masked_url())
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl FailoverEngine {
    /// Track `config.failover.nodes`, or the primary host when none are listed.
    ///
    /// All nodes start healthy.
    pub fn new(factory: Arc<ProviderFactory>, config: Config) -> DbResult<Self> {
        let policy = config.failover.clone();
        let configured = if policy.nodes.is_empty() {
            vec![config.primary_node()]
        } else {
            policy.nodes.clone()
        };

        let mut health: Vec<(String, bool)> = Vec::with_capacity(configured.len());
        for node in configured {
            split_node(&node)?;
            if !health.iter().any(|(n, _)| *n == node) {
                health.push((node, true));
            }
        }

        Ok(Self {
            factory,
            config,
            policy,
            health: RwLock::new(health),
            pools: TokioRwLock::new(HashMap::new()),
            total_attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            health_task: Mutex::new(None),
        })
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    fn nodes_where(&self, healthy: bool) -> Vec<String> {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, h)| *h == healthy)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Healthy nodes in configured order.
    pub fn healthy_nodes(&self) -> Vec<String> {
        self.nodes_where(true)
    }

    pub fn unhealthy_nodes(&self) -> Vec<String> {
        self.nodes_where(false)
    }

    /// Set a node's health; returns true if it changed. Unknown nodes are ignored.
    fn set_health(&self, node: &str, healthy: bool) -> bool {
        let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
        match health.iter_mut().find(|(n, _)| n == node) {
            Some((_, state)) if *state != healthy => {
                *state = healthy;
                true
            }
            Some(_) => false,
            None => {
                debug!(node = %node, "Ignoring health change for unknown node");
                false
            }
        }
    }

    pub fn mark_node_down(&self, node: &str) {
        if self.set_health(node, false) {
            warn!(node = %node, "Node marked down");
        }
    }

    pub fn mark_node_up(&self, node: &str) {
        if self.set_health(node, true) {
            info!(node = %node, "Node marked up");
        }
    }

    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            total_failover_attempts: self.total_attempts.load(Ordering::Relaxed),
            failed_failover_attempts: self.failed_attempts.load(Ordering::Relaxed),
            down_nodes: self.unhealthy_nodes(),
        }
    }

    /// The pool for `node`, created on first use.
    pub async fn pool_for(&self, node: &str) -> DbResult<Pool> {
        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(node) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                Arc::clone(
                    pools
                        .entry(node.to_string())
                        .or_insert_with(|| Arc::new(OnceCell::new())),
                )
            }
        };

        let pool = cell
            .get_or_try_init(|| async {
                debug!(node = %node, "Creating node pool");
                let config = self.config.for_node(node)?;
                self.factory.create_pool(&config).await
            })
            .await?;
        Ok(pool.clone())
    }

    /// Drop and close the pool of `node`, if one exists.
    async fn evict(&self, node: &str) {
        let cell = self.pools.write().await.remove(node);
        if let Some(pool) = cell.as_ref().and_then(|c| c.get()) {
            pool.close().await;
            debug!(node = %node, "Evicted node pool");
        }
    }

    async fn node_failed(&self, node: &str) {
        self.mark_node_down(node);
        self.evict(node).await;
    }

    /// Run `op` against the first healthy node, falling back on node failure.
    ///
    /// A temporary error marks the node down and moves on to the next
    /// healthy node, up to `max_failover_attempts`. Any other error is
    /// returned immediately.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> DbResult<T>
    where
        F: FnMut(Pool) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let max_attempts = self.policy.max_failover_attempts.max(1);
        let mut attempts = 0u32;
        let mut last_error = None;

        while attempts < max_attempts {
            if cancel.is_cancelled() {
                return Err(DbError::Cancelled);
            }
            let Some(node) = self.healthy_nodes().into_iter().next() else {
                break;
            };
            attempts += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);

            let result = match self.pool_for(&node).await {
                Ok(pool) => op(pool).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_temporary() => {
                    self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    warn!(node = %node, attempt = attempts, error = %e, "Node failed, failing over");
                    self.node_failed(&node).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        match last_error {
            Some(source) => Err(DbError::FailoverExhausted {
                attempts,
                source: Box::new(source),
            }),
            None => Err(DbError::NoHealthyNodes),
        }
    }

    /// Probe `node` with a standalone connection.
    pub async fn check_node(&self, node: &str) -> DbResult<()> {
        let config = self.config.for_node(node)?;
        let mut conn = self.factory.create_connection(&config).await?;
        let result = conn.ping().await;
        if let Err(e) = conn.close().await {
            debug!(node = %node, error = %e, "Error closing probe connection");
        }
        result
    }

    /// Start probing nodes in the background until `shutdown` fires.
    ///
    /// Healthy nodes are checked every `health_check_interval` and down nodes
    /// every `retry_interval`. Zero intervals disable the checker.
    pub fn spawn_health_checks(self: &Arc<Self>, shutdown: CancellationToken) {
        let healthy_every = self.policy.health_check_interval;
        let down_every = self.policy.retry_interval;
        if healthy_every.is_zero() || down_every.is_zero() {
            debug!("Health checks disabled");
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(Self::health_task(weak, shutdown, healthy_every, down_every));
        let previous = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    async fn health_task(
        weak: Weak<Self>,
        shutdown: CancellationToken,
        healthy_every: Duration,
        down_every: Duration,
    ) {
        let mut healthy_tick = tokio::time::interval(healthy_every);
        let mut down_tick = tokio::time::interval(down_every);
        healthy_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        down_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        healthy_tick.tick().await;
        down_tick.tick().await;

        loop {
            let probe_down = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = down_tick.tick() => true,
                _ = healthy_tick.tick() => false,
            };
            let Some(engine) = weak.upgrade() else {
                break;
            };
            let nodes = if probe_down {
                engine.unhealthy_nodes()
            } else {
                engine.healthy_nodes()
            };
            for node in nodes {
                match engine.check_node(&node).await {
                    Ok(()) if probe_down => engine.mark_node_up(&node),
                    Ok(()) => {}
                    Err(e) if !probe_down => {
                        warn!(node = %node, error = %e, "Health check failed");
                        engine.node_failed(&node).await;
                    }
                    Err(e) => debug!(node = %node, error = %e, "Node still down"),
                }
            }
        }
        debug!("Failover health checker stopped");
    }

    /// Stop health checks and close every node pool.
    pub async fn close(&self) {
        if let Some(handle) = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        let cells: Vec<Arc<OnceCell<Pool>>> =
            self.pools.write().await.drain().map(|(_, cell)| cell).collect();
        for cell in cells {
            if let Some(pool) = cell.get() {
                pool.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderId;

    fn engine(nodes: &[&str]) -> FailoverEngine {
        let config = Config::builder(ProviderId::POSTGRES)
            .host("primary")
            .port(5432)
            .database("app")
            .user("app")
            .failover_nodes(nodes.iter().map(|n| n.to_string()))
            .build();
        FailoverEngine::new(Arc::new(ProviderFactory::with_defaults()), config).unwrap()
    }

    #[test]
    fn test_defaults_to_primary_node() {
        let engine = engine(&[]);
        assert_eq!(engine.healthy_nodes(), vec!["primary:5432"]);
    }

    #[test]
    fn test_mark_down_and_up_round_trip() {
        let engine = engine(&["a:5432", "b:5432", "c:5432"]);
        engine.mark_node_down("b:5432");
        assert_eq!(engine.healthy_nodes(), vec!["a:5432", "c:5432"]);
        assert_eq!(engine.unhealthy_nodes(), vec!["b:5432"]);

        engine.mark_node_down("b:5432");
        assert_eq!(engine.unhealthy_nodes().len(), 1);

        engine.mark_node_up("b:5432");
        assert_eq!(engine.healthy_nodes(), vec!["a:5432", "b:5432", "c:5432"]);
        assert!(engine.stats().down_nodes.is_empty());
    }

    #[test]
    fn test_unknown_node_is_noop() {
        let engine = engine(&["a:5432"]);
        engine.mark_node_down("zzz:1");
        assert_eq!(engine.healthy_nodes(), vec!["a:5432"]);
    }

    #[test]
    fn test_duplicate_nodes_collapse() {
        let engine = engine(&["a:5432", "a:5432", "b"]);
        assert_eq!(engine.healthy_nodes(), vec!["a:5432", "b"]);
    }

    #[test]
    fn test_invalid_node_rejected() {
        let config = Config::builder(ProviderId::POSTGRES)
            .failover_nodes(vec!["host:notaport".to_string()])
            .build();
        assert!(FailoverEngine::new(Arc::new(ProviderFactory::new()), config).is_err());
    }

    #[tokio::test]
    async fn test_no_healthy_nodes() {
        let engine = engine(&["a:5432"]);
        engine.mark_node_down("a:5432");
        let cancel = CancellationToken::new();
        let err = engine
            .execute(&cancel, |_pool| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoHealthyNodes));
        assert_eq!(engine.stats().total_failover_attempts, 0);
    }
}
