//! Client reconnect and failover policy.
//!
//! A client holds an ordered ring of targets and talks to one at a time.
//! After every ended attempt it moves to the next target in ring order,
//! skipping targets that presented an unexpected certificate. Those are
//! blacklisted for the lifetime of the client. Once every target is
//! blacklisted there is no current target and the client stops trying.
//!
//! Retry delays grow exponentially between `min` and `max` and reset after a
//! successful connection. A bad certificate moves on without growing the
//! delay.

use std::{collections::HashSet, time::Duration};

use crate::address::NetworkHostAndPort;

/// Smallest delay between attempts.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Largest delay between attempts.
pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Ordered targets with a current position.
#[derive(Debug, Clone)]
pub struct TargetRing {
    targets: Vec<NetworkHostAndPort>,
    index: usize,
    exhausted: bool,
}

impl TargetRing {
    /// Create a ring starting at the first target.
    pub fn new(targets: Vec<NetworkHostAndPort>) -> Self {
        let exhausted = targets.is_empty();
        Self { targets, index: 0, exhausted }
    }

    /// All targets in ring order.
    pub fn targets(&self) -> &[NetworkHostAndPort] {
        &self.targets
    }

    /// Current target; `None` once every target is blacklisted.
    pub fn current(&self) -> Option<&NetworkHostAndPort> {
        if self.exhausted { None } else { self.targets.get(self.index) }
    }

    /// Advance to the next target not in `bad`.
    ///
    /// Wraps around the ring and may land on the current target again when it
    /// is the only usable one. Returns `None` when every target is in `bad`.
    pub fn next_target(
        &mut self,
        bad: &HashSet<NetworkHostAndPort>,
    ) -> Option<&NetworkHostAndPort> {
        if self.exhausted {
            return None;
        }
        let len = self.targets.len();
        let origin = self.index;
        self.index = (self.index + 1) % len;
        while bad.contains(&self.targets[self.index]) && self.index != origin {
            self.index = (self.index + 1) % len;
        }
        if bad.contains(&self.targets[self.index]) {
            self.exhausted = true;
        }
        self.current()
    }
}

/// Exponential retry delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff between `min` and `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max, current: min }
    }

    /// Delay to use now, without growing it.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Delay to use now; the following one is doubled, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    /// Back to `min`.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MIN_RETRY_INTERVAL, MAX_RETRY_INTERVAL)
    }
}

/// How a connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult {
    /// An established connection dropped
    Disconnected,
    /// TCP connect or handshake failed
    Failed,
    /// Peer identity not in the allow-list
    BadCertificate,
}

/// Target ring, backoff and blacklist of one client.
#[derive(Debug, Clone)]
pub struct Failover {
    ring: TargetRing,
    backoff: Backoff,
    bad_certificates: HashSet<NetworkHostAndPort>,
}

impl Failover {
    /// Create a policy with the given backoff.
    pub fn new(targets: Vec<NetworkHostAndPort>, backoff: Backoff) -> Self {
        Self { ring: TargetRing::new(targets), backoff, bad_certificates: HashSet::new() }
    }

    /// Current target.
    pub fn current(&self) -> Option<&NetworkHostAndPort> {
        self.ring.current()
    }

    /// Targets blacklisted so far.
    pub fn bad_certificates(&self) -> &HashSet<NetworkHostAndPort> {
        &self.bad_certificates
    }

    /// Delay the next attempt would wait.
    pub fn current_delay(&self) -> Duration {
        self.backoff.current()
    }

    /// A connection was established.
    pub fn on_connected(&mut self) {
        self.backoff.reset();
    }

    /// An attempt on the current target ended.
    ///
    /// Returns the next target and how long to wait before trying it, or
    /// `None` when no target is left.
    pub fn on_attempt_ended(
        &mut self,
        result: AttemptResult,
    ) -> Option<(NetworkHostAndPort, Duration)> {
        let delay = match result {
            AttemptResult::BadCertificate => {
                if let Some(target) = self.ring.current().cloned() {
                    self.bad_certificates.insert(target);
                }
                self.backoff.current()
            },
            AttemptResult::Disconnected | AttemptResult::Failed => self.backoff.next_delay(),
        };
        let next = self.ring.next_target(&self.bad_certificates).cloned()?;
        Some((next, delay))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn targets(n: u16) -> Vec<NetworkHostAndPort> {
        (0..n).map(|i| NetworkHostAndPort::new("localhost", 10000 + i)).collect()
    }

    #[test]
    fn ring_wraps_in_order() {
        let mut ring = TargetRing::new(targets(3));
        let none = HashSet::new();
        assert_eq!(ring.current().map(NetworkHostAndPort::port), Some(10000));
        assert_eq!(ring.next_target(&none).map(NetworkHostAndPort::port), Some(10001));
        assert_eq!(ring.next_target(&none).map(NetworkHostAndPort::port), Some(10002));
        assert_eq!(ring.next_target(&none).map(NetworkHostAndPort::port), Some(10000));
    }

    #[test]
    fn single_target_stays_current() {
        let mut ring = TargetRing::new(targets(1));
        assert_eq!(ring.next_target(&HashSet::new()).map(NetworkHostAndPort::port), Some(10000));
    }

    #[test]
    fn empty_ring_has_no_target() {
        let mut ring = TargetRing::new(Vec::new());
        assert!(ring.current().is_none());
        assert!(ring.next_target(&HashSet::new()).is_none());
    }

    #[test]
    fn all_bad_is_sticky_none() {
        let all = targets(2);
        let bad: HashSet<_> = all.iter().cloned().collect();
        let mut ring = TargetRing::new(all);
        assert!(ring.next_target(&bad).is_none());
        assert!(ring.current().is_none());
        assert!(ring.next_target(&HashSet::new()).is_none());
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn bad_certificate_does_not_double() {
        let mut failover = Failover::new(targets(3), Backoff::default());
        let (next, delay) = failover.on_attempt_ended(AttemptResult::BadCertificate).unwrap();
        assert_eq!(next.port(), 10001);
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(failover.current_delay(), Duration::from_secs(1));
        assert!(failover.bad_certificates().contains(&targets(1)[0]));

        let (_, delay) = failover.on_attempt_ended(AttemptResult::Failed).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(failover.current_delay(), Duration::from_secs(2));
    }

    #[test]
    fn connected_resets_backoff() {
        let mut failover = Failover::new(targets(2), Backoff::default());
        failover.on_attempt_ended(AttemptResult::Failed);
        failover.on_attempt_ended(AttemptResult::Failed);
        failover.on_connected();
        assert_eq!(failover.current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn every_target_bad_stops_failover() {
        let mut failover = Failover::new(targets(2), Backoff::default());
        assert!(failover.on_attempt_ended(AttemptResult::BadCertificate).is_some());
        assert!(failover.on_attempt_ended(AttemptResult::BadCertificate).is_none());
        assert!(failover.current().is_none());
    }

    proptest! {
        #[test]
        fn next_target_never_returns_bad(
            n in 1u16..8,
            bad_mask in proptest::collection::vec(any::<bool>(), 8),
            steps in 1usize..20,
        ) {
            let all = targets(n);
            let bad: HashSet<_> = all
                .iter()
                .zip(&bad_mask)
                .filter(|(_, b)| **b)
                .map(|(t, _)| t.clone())
                .collect();
            let mut ring = TargetRing::new(all.clone());

            for _ in 0..steps {
                match ring.next_target(&bad) {
                    Some(target) => prop_assert!(!bad.contains(target)),
                    None => {
                        prop_assert_eq!(bad.len(), all.len());
                        break;
                    },
                }
            }
        }

        #[test]
        fn backoff_stays_within_bounds(failures in 0usize..40) {
            let mut backoff = Backoff::default();
            for _ in 0..failures {
                let delay = backoff.next_delay();
                prop_assert!(delay >= MIN_RETRY_INTERVAL && delay <= MAX_RETRY_INTERVAL);
            }
            backoff.reset();
            prop_assert_eq!(backoff.current(), MIN_RETRY_INTERVAL);
        }
    }
}
