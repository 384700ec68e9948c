//! # Failure and Reconnect Policies
//!
//! Purpose: Decide when an I/O error takes a node out of service, and how long
//! to wait before trying to bring it back.
//!
//! ## Design Principles
//! 1. **Per-Node Failure State**: Each node owns its `FailurePolicy`, so error
//!    counting never crosses connections.
//! 2. **Shared Reconnect Schedule**: One `ReconnectPolicy` serves the whole
//!    cluster and keys its backoff state by endpoint.
//! 3. **Success Resets Backoff**: A successful reconnect calls `reset`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::node::Node;

/// Decides whether an I/O error is fatal for a node.
pub trait FailurePolicy: Send {
    /// Returns true to fail the node, false to reconnect in place and retry.
    fn should_fail(&mut self, error: &io::Error) -> bool;

    /// Clears accumulated error state (called after a successful reconnect).
    fn reset(&mut self) {}
}

/// Builds one failure policy per node.
pub type FailurePolicyFactory = Arc<dyn Fn() -> Box<dyn FailurePolicy> + Send + Sync>;

/// Fails the node on the first error.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateFailurePolicy;

impl FailurePolicy for ImmediateFailurePolicy {
    fn should_fail(&mut self, _error: &io::Error) -> bool {
        true
    }
}

/// Fails the node once `threshold` errors occur, each within `reset_after` of
/// the previous one. Isolated errors only trigger an in-place reconnect.
#[derive(Debug, Clone)]
pub struct ThrottlingFailurePolicy {
    threshold: usize,
    reset_after: Duration,
    failures: usize,
    last_failure: Option<Instant>,
}

impl ThrottlingFailurePolicy {
    pub fn new(threshold: usize, reset_after: Duration) -> Self {
        ThrottlingFailurePolicy {
            threshold: threshold.max(1),
            reset_after,
            failures: 0,
            last_failure: None,
        }
    }
}

impl FailurePolicy for ThrottlingFailurePolicy {
    fn should_fail(&mut self, _error: &io::Error) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) > self.reset_after {
                self.failures = 0;
            }
        }

        self.failures += 1;
        self.last_failure = Some(now);
        if self.failures >= self.threshold {
            self.failures = 0;
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.last_failure = None;
    }
}

/// Computes the delay before the next reconnect attempt.
pub trait ReconnectPolicy: Send + Sync {
    /// Delay before the next attempt for `node`; zero means retry now.
    fn schedule(&self, node: &Node) -> Duration;

    /// Forgets backoff state after `node` reconnected.
    fn reset(&self, node: &Node);
}

/// Retries at a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicReconnectPolicy {
    interval: Duration,
}

impl PeriodicReconnectPolicy {
    pub fn new(interval: Duration) -> Self {
        PeriodicReconnectPolicy { interval }
    }
}

impl ReconnectPolicy for PeriodicReconnectPolicy {
    fn schedule(&self, _node: &Node) -> Duration {
        self.interval
    }

    fn reset(&self, _node: &Node) {}
}

/// Doubles the delay on each consecutive attempt, capped at `max`.
#[derive(Debug)]
pub struct ExponentialReconnectPolicy {
    initial: Duration,
    max: Duration,
    attempts: Mutex<AHashMap<SocketAddr, u32>>,
}

impl ExponentialReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialReconnectPolicy {
            initial,
            max: max.max(initial),
            attempts: Mutex::new(AHashMap::new()),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl ReconnectPolicy for ExponentialReconnectPolicy {
    fn schedule(&self, node: &Node) -> Duration {
        let mut attempts = self.attempts.lock();
        let attempt = attempts.entry(node.endpoint()).or_insert(0);
        let delay = self.delay_for(*attempt);
        *attempt = attempt.saturating_add(1);
        delay
    }

    fn reset(&self, node: &Node) {
        self.attempts.lock().remove(&node.endpoint());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::test_node;

    fn err() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "reset")
    }

    #[test]
    fn immediate_always_fails() {
        let mut policy = ImmediateFailurePolicy;
        assert!(policy.should_fail(&err()));
        assert!(policy.should_fail(&err()));
    }

    #[test]
    fn throttling_fails_after_threshold() {
        let mut policy = ThrottlingFailurePolicy::new(3, Duration::from_secs(60));
        assert!(!policy.should_fail(&err()));
        assert!(!policy.should_fail(&err()));
        assert!(policy.should_fail(&err()));
        // Counter starts over after tripping.
        assert!(!policy.should_fail(&err()));
    }

    #[test]
    fn throttling_forgets_old_errors() {
        let mut policy = ThrottlingFailurePolicy::new(2, Duration::from_millis(10));
        assert!(!policy.should_fail(&err()));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!policy.should_fail(&err()));
        assert!(policy.should_fail(&err()));

        policy.should_fail(&err());
        policy.reset();
        assert!(!policy.should_fail(&err()));
    }

    #[test]
    fn periodic_is_constant() {
        let (node, _socket) = test_node();
        let policy = PeriodicReconnectPolicy::new(Duration::from_millis(250));
        assert_eq!(policy.schedule(&node), Duration::from_millis(250));
        assert_eq!(policy.schedule(&node), Duration::from_millis(250));
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let (node, _socket) = test_node();
        let policy = ExponentialReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (0..5).map(|_| policy.schedule(&node)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );

        policy.reset(&node);
        assert_eq!(policy.schedule(&node), Duration::from_millis(100));
    }

    #[test]
    fn exponential_large_attempt_saturates() {
        let policy = ExponentialReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }
}
