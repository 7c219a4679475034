//! Retry and failover engines.
//!
//! Both engines wrap caller-supplied async operations. A typical stack runs
//! the retry engine outermost so a failover pass that exhausts every node can
//! itself be retried after backoff.

pub mod failover;
pub mod retry;

pub use failover::{FailoverEngine, FailoverStats};
pub use retry::{RetryEngine, RetryPredicate, RetryStats, is_retryable_error};
