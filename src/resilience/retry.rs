//! Retry engine: bounded exponential backoff with jitter.
//!
//! [`RetryEngine::execute`] runs an operation until it succeeds, fails with
//! an error the predicate refuses to retry, or the attempt budget
//! (`RetryPolicy::max_retries`, counting the first attempt) is spent.
//!
//! Backoff before attempt `n` (n >= 2) is
//! `min(initial_interval * multiplier^(n-1), max_interval)`, then scaled by a
//! random factor in `[0.5, 1.5)` when jitter is enabled.

use crate::config::RetryPolicy;
use crate::error::{DbError, DbResult, ErrorKind};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Decides whether an error is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&DbError) -> bool + Send + Sync>;

/// Message fragments of transient network failures.
const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "broken pipe",
    "no such host",
    "unreachable",
    "dns",
];

/// Default retryability predicate.
///
/// Temporary errors (connection failures and timeouts) are retried.
/// Configuration, transaction-state, no-rows, duplicate-key, unsupported and
/// cancelled errors never are, whatever their message says. Backend and
/// internal errors are retried only when their message names a network
/// failure.
pub fn is_retryable_error(err: &DbError) -> bool {
    if err.is_temporary() {
        return true;
    }
    match err.kind() {
        ErrorKind::Database | ErrorKind::Internal => {
            let message = err.to_string().to_lowercase();
            NETWORK_ERROR_PATTERNS.iter().any(|p| message.contains(p))
        }
        _ => false,
    }
}

/// Cumulative retry statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    /// Every invocation of the operation, first attempts included
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Retries per finished operation
    pub average_retries: f64,
    pub last_retry_at: Option<DateTime<Utc>>,
}

pub struct RetryEngine {
    policy: RetryPolicy,
    predicate: RetryPredicate,
    stats: Mutex<RetryStats>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for RetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryEngine")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_entropy())
    }

    /// An engine whose jitter sequence is reproducible.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            policy,
            predicate: Arc::new(is_retryable_error),
            stats: Mutex::new(RetryStats::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Replace the retryability predicate.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&DbError) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn max_attempts(&self) -> u32 {
        self.policy.max_retries.max(1)
    }

    /// Backoff before `attempt` without jitter; zero for the first attempt.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let max = self.policy.max_interval;
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.policy.initial_interval.as_secs_f64()
            * self.policy.multiplier.max(1.0).powi(exponent);
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            return max;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(max)
    }

    /// Backoff before `attempt`, jittered when the policy asks for it.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if !self.policy.jitter || base.is_zero() {
            return base;
        }
        let factor = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .gen_range(0.5..1.5);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// Run `op` with retries.
    ///
    /// Errors the predicate rejects are returned unchanged; running out of
    /// attempts yields [`DbError::RetryExhausted`] wrapping the last error.
    /// Cancellation is checked before each attempt and wins over a pending
    /// backoff sleep.
    pub async fn execute<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> DbResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                self.finish(false);
                return Err(DbError::Cancelled);
            }
            attempt += 1;
            self.record_attempt(attempt);

            let err = match op().await {
                Ok(value) => {
                    self.finish(true);
                    if attempt > 1 {
                        debug!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !(self.predicate)(&err) {
                self.finish(false);
                return Err(err);
            }
            if attempt >= max_attempts {
                self.finish(false);
                warn!(attempts = attempt, error = %err, "Retries exhausted");
                return Err(DbError::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.backoff_delay(attempt + 1);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after temporary failure"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.finish(false);
                    return Err(DbError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn lock_stats(&self) -> MutexGuard<'_, RetryStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_attempt(&self, attempt: u32) {
        let mut stats = self.lock_stats();
        stats.total_attempts += 1;
        if attempt > 1 {
            stats.total_retries += 1;
            stats.last_retry_at = Some(Utc::now());
        }
    }

    fn finish(&self, success: bool) {
        let mut stats = self.lock_stats();
        if success {
            stats.successful_operations += 1;
        } else {
            stats.failed_operations += 1;
        }
        let finished = stats.successful_operations + stats.failed_operations;
        stats.average_retries = stats.total_retries as f64 / finished as f64;
    }

    pub fn stats(&self) -> RetryStats {
        self.lock_stats().clone()
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = RetryStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            multiplier: 2.0,
            jitter,
        }
    }

    fn refused() -> DbError {
        DbError::connection("connection refused", "start the server")
    }

    #[test]
    fn test_base_backoff_monotonic_and_bounded() {
        let engine = RetryEngine::new(policy(10, false));
        assert_eq!(engine.base_backoff(1), Duration::ZERO);
        assert_eq!(engine.base_backoff(2), Duration::from_millis(20));
        assert_eq!(engine.base_backoff(3), Duration::from_millis(40));

        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = engine.base_backoff(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(100));
            previous = delay;
        }
        assert_eq!(engine.base_backoff(u32::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_multiplier_below_one_is_flat() {
        let mut p = policy(5, false);
        p.multiplier = 0.5;
        let engine = RetryEngine::new(p);
        assert_eq!(engine.base_backoff(2), Duration::from_millis(10));
        assert_eq!(engine.base_backoff(5), Duration::from_millis(10));
    }

    #[test]
    fn test_seeded_jitter_is_reproducible_and_in_range() {
        let a = RetryEngine::with_seed(policy(5, true), 42);
        let b = RetryEngine::with_seed(policy(5, true), 42);
        for attempt in 2..6 {
            let da = a.backoff_delay(attempt);
            assert_eq!(da, b.backoff_delay(attempt));
            let base = a.base_backoff(attempt);
            assert!(da >= base.mul_f64(0.5));
            assert!(da < base.mul_f64(1.5));
        }
    }

    #[test]
    fn test_default_predicate() {
        assert!(is_retryable_error(&refused()));
        assert!(is_retryable_error(&DbError::timeout("query", Duration::from_secs(1))));
        assert!(!is_retryable_error(&DbError::Cancelled));
        assert!(!is_retryable_error(&DbError::NoRows));
        assert!(is_retryable_error(&DbError::internal("dns lookup failed")));
        assert!(!is_retryable_error(&DbError::duplicate_key("dup", None)));
    }

    #[test]
    fn test_network_words_do_not_make_state_errors_retryable() {
        let tx = DbError::invalid_operation("unknown savepoint 'dns_checkpoint'");
        assert_eq!(tx.kind(), ErrorKind::Transaction);
        assert!(!is_retryable_error(&tx));

        let cfg = DbError::configuration("invalid value 'x' for query_timeout");
        assert_eq!(cfg.kind(), ErrorKind::Configuration);
        assert!(!is_retryable_error(&cfg));

        let dup = DbError::duplicate_key("connection reset while inserting", None);
        assert!(!is_retryable_error(&dup));
        assert!(!is_retryable_error(&DbError::PoolClosed));

        let wrapped = DbError::configuration("host unreachable").with_operation("connect");
        assert!(!is_retryable_error(&wrapped));

        let backend = DbError::database("server closed: broken pipe", None, "reconnect");
        assert!(is_retryable_error(&backend));
    }

    #[tokio::test]
    async fn test_transaction_error_is_not_rerun() {
        let engine = RetryEngine::new(policy(5, false));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let err = engine
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DbError::invalid_operation(
                    "unknown savepoint 'dns_checkpoint'",
                ))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DbError::InvalidOperation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_jitter_near_duration_max_does_not_panic() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_interval: Duration::MAX,
            max_interval: Duration::MAX,
            multiplier: 2.0,
            jitter: true,
        };
        let engine = RetryEngine::with_seed(p, 7);
        for attempt in 2..6 {
            assert!(engine.backoff_delay(attempt) >= Duration::from_secs(1));
        }
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let engine = RetryEngine::new(policy(3, false));
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let value = engine
            .execute(&cancel, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(refused())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        let stats = engine.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.successful_operations, 1);
        assert!((stats.average_retries - 2.0).abs() < f64::EPSILON);
        assert!(stats.last_retry_at.is_some());
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_last_error() {
        let engine = RetryEngine::new(policy(2, false));
        let cancel = CancellationToken::new();
        let err = engine
            .execute(&cancel, || async { Err::<(), _>(refused()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::RetryExhausted { attempts: 2, .. }));
        assert!(err.is_temporary());
        assert_eq!(engine.stats().failed_operations, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_returned_unchanged() {
        let engine = RetryEngine::new(policy(5, false));
        let cancel = CancellationToken::new();
        let err = engine
            .execute(&cancel, || async { Err::<(), _>(DbError::NoRows) })
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
        assert_eq!(engine.stats().total_attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let mut p = policy(5, false);
        p.initial_interval = Duration::from_secs(30);
        p.max_interval = Duration::from_secs(60);
        let engine = RetryEngine::new(p);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = engine
            .execute(&cancel, || async { Err::<(), _>(refused()) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let engine = RetryEngine::new(policy(3, false)).with_predicate(|e| e.is_no_rows());
        let cancel = CancellationToken::new();
        let err = engine
            .execute(&cancel, || async { Err::<(), _>(DbError::NoRows) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::RetryExhausted { attempts: 3, .. }));
    }
}
