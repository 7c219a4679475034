//! Connection pool.
//!
//! The pool bounds concurrent leases with a semaphore (one permit per
//! connection slot) and keeps returned connections on a LIFO idle stack.
//!
//! # Design Decisions
//!
//! - **Permit travels with the lease**: a [`PooledConnection`] owns its
//!   `OwnedSemaphorePermit`, so a slot is only freed after the connection has
//!   been reclaimed (rolled back, tenant cleared, pushed idle or destroyed).
//! - **Counters are atomics**: [`Pool::stats`] never takes a lock and never
//!   waits on acquire/release.
//! - **`std::sync::Mutex` for the idle stack**: held only for push/pop, never
//!   across an `.await`.
//! - **Maintenance holds a `Weak`**: the background task ends by itself once
//!   the last `Pool` handle is dropped.

use crate::config::{Config, duration_ms};
use crate::db::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam, Row, TenantId, TxOptions};
use crate::db::batch::{Batch, BatchResults};
use crate::db::transaction::Transaction;
use crate::provider::BackendStrategy;
use futures_util::future::try_join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time pool statistics.
///
/// Counts are read from independent atomics and are eventually consistent
/// with concurrent acquire/release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently leased
    pub acquired_conns: u64,
    pub idle_conns: u64,
    /// Connections being opened right now
    pub constructing_conns: u64,
    /// acquired + idle + constructing
    pub total_conns: u64,
    pub max_conns: u64,
    /// Successful acquires since creation
    pub acquire_count: u64,
    #[serde(with = "duration_ms")]
    pub acquire_duration: Duration,
    pub canceled_acquire_count: u64,
    /// Acquires that had to wait because every slot was leased
    pub empty_acquire_count: u64,
    pub new_conns_count: u64,
    pub max_lifetime_destroy_count: u64,
    pub max_idle_destroy_count: u64,
    pub broken_destroy_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestroyReason {
    MaxLifetime,
    MaxIdleTime,
    Broken,
    Closed,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    idle: AtomicU64,
    constructing: AtomicU64,
    acquire_count: AtomicU64,
    acquire_micros: AtomicU64,
    canceled_acquire: AtomicU64,
    empty_acquire: AtomicU64,
    new_conns: AtomicU64,
    max_lifetime_destroy: AtomicU64,
    max_idle_destroy: AtomicU64,
    broken_destroy: AtomicU64,
}

impl Counters {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturating decrement; an extra release must not wrap the gauge.
    fn decr(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(1))
        });
    }

    fn record_destroy(&self, reason: DestroyReason) {
        match reason {
            DestroyReason::MaxLifetime => Self::incr(&self.max_lifetime_destroy),
            DestroyReason::MaxIdleTime => Self::incr(&self.max_idle_destroy),
            DestroyReason::Broken => Self::incr(&self.broken_destroy),
            DestroyReason::Closed => {}
        }
    }
}

/// Keeps the constructing gauge accurate even if the open future is dropped.
struct ConstructingGuard<'a>(&'a AtomicU64);

impl<'a> ConstructingGuard<'a> {
    fn new(counter: &'a AtomicU64) -> Self {
        Counters::incr(counter);
        Self(counter)
    }
}

impl Drop for ConstructingGuard<'_> {
    fn drop(&mut self) {
        Counters::decr(self.0);
    }
}

pub(crate) struct PoolInner {
    strategy: Arc<dyn BackendStrategy>,
    config: Arc<Config>,
    max_conns: u32,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
    counters: Counters,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    fn idle_stack(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Why `conn` must not go back on the idle stack, if at all.
    fn expiry(&self, conn: &Connection) -> Option<DestroyReason> {
        if self.is_closed() {
            Some(DestroyReason::Closed)
        } else if conn.is_broken() {
            Some(DestroyReason::Broken)
        } else if conn.age() > self.config.pool.max_lifetime_or_default() {
            Some(DestroyReason::MaxLifetime)
        } else if conn.idle_time() > self.config.pool.max_idle_time_or_default() {
            Some(DestroyReason::MaxIdleTime)
        } else {
            None
        }
    }

    async fn open(&self) -> DbResult<Connection> {
        let _constructing = ConstructingGuard::new(&self.counters.constructing);
        let conn = self.strategy.create_connection(&self.config).await?;
        Counters::incr(&self.counters.new_conns);
        debug!(connection_id = %conn.id(), "Opened pool connection");
        Ok(conn)
    }

    async fn destroy(&self, conn: Connection, reason: DestroyReason) {
        self.counters.record_destroy(reason);
        let id = conn.id().to_string();
        if let Err(e) = conn.close().await {
            debug!(connection_id = %id, error = %e, "Error closing pool connection");
        }
        debug!(connection_id = %id, ?reason, "Destroyed pool connection");
    }

    fn push_idle(&self, conn: Connection) {
        self.idle_stack().push(conn);
        Counters::incr(&self.counters.idle);
    }

    /// Pop an idle connection, discarding any that expired while idle.
    async fn pop_idle(&self) -> Option<Connection> {
        loop {
            let conn = self.idle_stack().pop()?;
            Counters::decr(&self.counters.idle);
            match self.expiry(&conn) {
                None => return Some(conn),
                Some(reason) => self.destroy(conn, reason).await,
            }
        }
    }

    /// Return a leased connection: roll back, clear tenant, then keep or destroy.
    async fn reclaim(&self, mut conn: Connection) {
        Counters::decr(&self.counters.acquired);

        if conn.in_transaction() {
            warn!(connection_id = %conn.id(), "Rolling back transaction left open on release");
            if let Err(e) = conn.rollback_open_transaction().await {
                warn!(connection_id = %conn.id(), error = %e, "Rollback on release failed");
                conn.mark_broken();
            }
        }
        if let Err(e) = conn.clear_tenant().await {
            warn!(connection_id = %conn.id(), error = %e, "Failed to clear tenant scope");
            conn.mark_broken();
        }

        match self.expiry(&conn) {
            None => self.push_idle(conn),
            Some(reason) => self.destroy(conn, reason).await,
        }
    }

    fn snapshot(&self) -> PoolStats {
        let c = &self.counters;
        let acquired = c.acquired.load(Ordering::Relaxed);
        let idle = c.idle.load(Ordering::Relaxed);
        let constructing = c.constructing.load(Ordering::Relaxed);
        PoolStats {
            acquired_conns: acquired,
            idle_conns: idle,
            constructing_conns: constructing,
            total_conns: acquired + idle + constructing,
            max_conns: u64::from(self.max_conns),
            acquire_count: c.acquire_count.load(Ordering::Relaxed),
            acquire_duration: Duration::from_micros(c.acquire_micros.load(Ordering::Relaxed)),
            canceled_acquire_count: c.canceled_acquire.load(Ordering::Relaxed),
            empty_acquire_count: c.empty_acquire.load(Ordering::Relaxed),
            new_conns_count: c.new_conns.load(Ordering::Relaxed),
            max_lifetime_destroy_count: c.max_lifetime_destroy.load(Ordering::Relaxed),
            max_idle_destroy_count: c.max_idle_destroy.load(Ordering::Relaxed),
            broken_destroy_count: c.broken_destroy.load(Ordering::Relaxed),
        }
    }

    /// Open connections until `min_connections` exist or no slot is free.
    async fn top_up(&self) -> DbResult<()> {
        let min = u64::from(self.config.pool.min_connections_or_default());
        loop {
            let stats = self.snapshot();
            if self.is_closed() || stats.total_conns >= min {
                return Ok(());
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                return Ok(());
            };
            let conn = self.open().await?;
            self.push_idle(conn);
            drop(permit);
        }
    }

    /// Destroy idle connections past their lifetime or idle limit.
    async fn prune_idle(&self) {
        let expired: Vec<(Connection, DestroyReason)> = {
            let mut idle = self.idle_stack();
            let mut expired = Vec::new();
            let mut keep = Vec::with_capacity(idle.len());
            for conn in idle.drain(..) {
                match self.expiry(&conn) {
                    Some(reason) => expired.push((conn, reason)),
                    None => keep.push(conn),
                }
            }
            *idle = keep;
            expired
        };
        for (conn, reason) in expired {
            Counters::decr(&self.counters.idle);
            self.destroy(conn, reason).await;
        }
    }

    async fn maintenance_task(weak: Weak<PoolInner>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.is_closed() {
                break;
            }
            inner.prune_idle().await;
            if let Err(e) = inner.top_up().await {
                warn!(error = %e, "Failed to replenish minimum connections");
            }
        }
        debug!("Pool maintenance task stopped");
    }
}

/// A bounded pool of connections for one [`Config`].
///
/// Cloning is cheap; clones share the same connections and counters.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("provider", &self.inner.config.provider)
            .field("url", &self.inner.config.masked_url())
            .field("closed", &self.is_closed())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Pool {
    /// Create a pool that opens connections through `strategy`.
    ///
    /// `min_connections` are opened before this returns; a failure there closes
    /// the pool and is reported.
    pub async fn connect(strategy: Arc<dyn BackendStrategy>, config: Arc<Config>) -> DbResult<Self> {
        config.pool.validate().map_err(DbError::configuration)?;
        let max_conns = config.pool.max_connections_or_default();
        let min_conns = config.pool.min_connections_or_default().min(max_conns);

        let inner = Arc::new(PoolInner {
            strategy,
            config,
            max_conns,
            semaphore: Arc::new(Semaphore::new(max_conns as usize)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            maintenance: Mutex::new(None),
        });
        let pool = Pool { inner };

        if min_conns > 0 {
            let warm = (0..min_conns).map(|_| pool.inner.open());
            match try_join_all(warm).await {
                Ok(conns) => conns.into_iter().for_each(|c| pool.inner.push_idle(c)),
                Err(e) => {
                    pool.close().await;
                    return Err(e.with_operation("pool warm-up"));
                }
            }
        }

        let period = pool.inner.config.pool.health_check_period_or_default();
        if !period.is_zero() {
            let weak = Arc::downgrade(&pool.inner);
            let handle = tokio::spawn(PoolInner::maintenance_task(weak, period));
            *pool
                .inner
                .maintenance
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }

        info!(
            provider = %pool.inner.config.provider,
            url = %pool.inner.config.masked_url(),
            max_connections = max_conns,
            min_connections = min_conns,
            "Connection pool created"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn database_type(&self) -> DatabaseType {
        self.inner.strategy.database_type()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Lease a connection, waiting until one is free, `cancel` fires or the
    /// pool's `acquire_timeout` elapses (zero waits indefinitely).
    ///
    /// With multi-tenancy enabled a tenant is required and is applied before
    /// the connection is returned; otherwise passing a tenant is an error.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        tenant: Option<&TenantId>,
    ) -> DbResult<PooledConnection> {
        self.check_tenant(tenant)?;
        self.acquire_scoped(cancel, tenant, self.configured_acquire_timeout()).await
    }

    /// Like [`Pool::acquire`] without a token, bounded by `timeout` in place
    /// of the configured `acquire_timeout`.
    pub async fn acquire_with_timeout(
        &self,
        timeout: Duration,
        tenant: Option<&TenantId>,
    ) -> DbResult<PooledConnection> {
        self.check_tenant(tenant)?;
        let cancel = CancellationToken::new();
        self.acquire_scoped(&cancel, tenant, Some(timeout)).await
    }

    fn configured_acquire_timeout(&self) -> Option<Duration> {
        Some(self.inner.config.pool.acquire_timeout_or_default()).filter(|t| !t.is_zero())
    }

    fn check_tenant(&self, tenant: Option<&TenantId>) -> DbResult<()> {
        match (self.inner.config.multi_tenant, tenant) {
            (true, None) => Err(DbError::invalid_input(
                "a tenant is required when multi-tenancy is enabled",
            )),
            (false, Some(t)) => Err(DbError::invalid_input(format!(
                "tenant '{t}' given but multi-tenancy is disabled"
            ))),
            _ => Ok(()),
        }
    }

    async fn acquire_scoped(
        &self,
        cancel: &CancellationToken,
        tenant: Option<&TenantId>,
        timeout: Option<Duration>,
    ) -> DbResult<PooledConnection> {
        let counters = &self.inner.counters;
        if cancel.is_cancelled() {
            Counters::incr(&counters.canceled_acquire);
            return Err(DbError::Cancelled);
        }
        if self.is_closed() {
            return Err(DbError::PoolClosed);
        }

        let start = Instant::now();
        let bounded = async {
            let Some(timeout) = timeout else {
                return self.checkout(tenant).await;
            };
            match tokio::time::timeout(timeout, self.checkout(tenant)).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout("acquire connection", timeout)),
            }
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DbError::Cancelled),
            result = bounded => result,
        };

        match result {
            Ok(lease) => {
                Counters::incr(&counters.acquire_count);
                counters
                    .acquire_micros
                    .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
                Ok(lease)
            }
            Err(e) => {
                if e.is_cancelled() {
                    Counters::incr(&counters.canceled_acquire);
                }
                Err(e)
            }
        }
    }

    async fn checkout(&self, tenant: Option<&TenantId>) -> DbResult<PooledConnection> {
        let inner = &self.inner;
        let permit = match inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(DbError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                Counters::incr(&inner.counters.empty_acquire);
                inner
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| DbError::PoolClosed)?
            }
        };

        let mut conn = match inner.pop_idle().await {
            Some(conn) => conn,
            None => inner.open().await?,
        };

        if let Some(tenant) = tenant {
            if let Err(e) = conn.set_tenant(tenant).await {
                inner.destroy(conn, DestroyReason::Broken).await;
                return Err(e);
            }
        }

        Counters::incr(&inner.counters.acquired);
        Ok(PooledConnection {
            conn: Some(conn),
            permit: Some(permit),
            pool: Arc::clone(inner),
        })
    }

    /// Acquire, ping and release one connection. Failures are returned, never hidden.
    pub async fn ping(&self, cancel: &CancellationToken) -> DbResult<()> {
        let mut lease = self
            .acquire_scoped(cancel, None, self.configured_acquire_timeout())
            .await?;
        let result = lease.ping().await;
        lease.release().await?;
        result
    }

    /// Lock-free statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        self.inner.snapshot()
    }

    /// Close the pool: destroy idle connections and fail later acquires.
    ///
    /// Leased connections are destroyed when they are released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();
        if let Some(handle) = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let idle: Vec<Connection> = std::mem::take(&mut *self.inner.idle_stack());
        let count = idle.len();
        for conn in idle {
            Counters::decr(&self.inner.counters.idle);
            self.inner.destroy(conn, DestroyReason::Closed).await;
        }
        info!(
            provider = %self.inner.config.provider,
            closed_idle = count,
            "Connection pool closed"
        );
    }
}

/// A connection leased from a [`Pool`].
///
/// Return it with [`PooledConnection::release`]. Dropping an unreleased lease
/// reclaims it on a spawned task.
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.conn)
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// The underlying connection, or [`DbError::ConnectionReleased`] after release.
    pub fn connection(&mut self) -> DbResult<&mut Connection> {
        self.conn.as_mut().ok_or(DbError::ConnectionReleased)
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    pub fn id(&self) -> Option<&str> {
        self.conn.as_ref().map(Connection::id)
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.conn.as_ref().and_then(Connection::tenant)
    }

    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Row> {
        self.connection()?.query_one(sql, params).await
    }

    pub async fn query_optional(
        &mut self,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Option<Row>> {
        self.connection()?.query_optional(sql, params).await
    }

    pub async fn query_all(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.connection()?.query_all(sql, params).await
    }

    pub async fn exec(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.connection()?.exec(sql, params).await
    }

    pub async fn send_batch(&mut self, batch: &Batch) -> DbResult<BatchResults> {
        self.connection()?.send_batch(batch).await
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        self.connection()?.ping().await
    }

    pub async fn begin(&mut self, opts: TxOptions) -> DbResult<Transaction<'_>> {
        self.connection()?.begin(opts).await
    }

    /// Return the connection to its pool.
    ///
    /// A second call returns [`DbError::ConnectionReleased`] and changes nothing.
    pub async fn release(&mut self) -> DbResult<()> {
        let conn = self.conn.take().ok_or(DbError::ConnectionReleased)?;
        let permit = self.permit.take();
        self.pool.reclaim(conn).await;
        drop(permit);
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(connection_id = %conn.id(), "Connection released via Drop");
                handle.spawn(async move {
                    pool.reclaim(conn).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // No runtime to run the async reclaim on; the channel is dropped.
                Counters::decr(&pool.counters.acquired);
                drop(conn);
                drop(permit);
            }
        }
    }
}
