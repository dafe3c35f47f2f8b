#![forbid(unsafe_code)]

//! Lazy per-key expiration records.
//!
//! The tracker knows nothing about values or type stores; it maps a key to an
//! optional absolute deadline in milliseconds and answers whether the key is
//! logically present at a given instant. Callers check [`ExpirationTracker::state`]
//! before every read or mutation and drop the backing entry on `Expired`.

use std::collections::HashMap;

/// Logical presence of a key's expiration record at an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryState {
    /// No TTL has been set for the key.
    NotManaged,
    /// A TTL exists and the deadline is still in the future.
    NotExpired,
    /// A TTL exists and the deadline has passed; the key must behave as absent.
    Expired,
}

/// Result of a TTL query against a live keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlValue {
    /// The key does not exist (or has already expired).
    KeyMissing,
    /// The key exists but carries no expiration.
    NoExpiry,
    /// Remaining time to live, in whole seconds (rounded up).
    Remaining(i64),
}

#[derive(Debug, Default, Clone)]
pub struct ExpirationTracker {
    deadlines: HashMap<Vec<u8>, u64>,
}

impl ExpirationTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace the absolute expiry deadline for a key.
    pub fn set_expire_at(&mut self, key: &[u8], at_ms: u64) {
        self.deadlines.insert(key.to_vec(), at_ms);
    }

    #[must_use]
    pub fn deadline_ms(&self, key: &[u8]) -> Option<u64> {
        self.deadlines.get(key).copied()
    }

    /// A deadline exactly at `now_ms` counts as expired.
    #[must_use]
    pub fn state(&self, key: &[u8], now_ms: u64) -> ExpiryState {
        match self.deadlines.get(key) {
            None => ExpiryState::NotManaged,
            Some(at_ms) if *at_ms <= now_ms => ExpiryState::Expired,
            Some(_) => ExpiryState::NotExpired,
        }
    }

    /// Remaining TTL in whole seconds, rounded up. `None` when the key carries
    /// no expiration record.
    #[must_use]
    pub fn ttl_seconds(&self, key: &[u8], now_ms: u64) -> Option<i64> {
        self.deadlines.get(key).map(|at_ms| {
            let remain_ms = at_ms.saturating_sub(now_ms);
            i64::try_from(remain_ms.div_ceil(1000)).unwrap_or(i64::MAX)
        })
    }

    /// Remove the record for a key, reporting whether one existed. Backs the
    /// `persist` command.
    pub fn clear(&mut self, key: &[u8]) -> bool {
        self.deadlines.remove(key).is_some()
    }

    /// Drop the record unconditionally (key deletion or replacement).
    pub fn remove(&mut self, key: &[u8]) {
        self.deadlines.remove(key);
    }

    /// Move `from`'s record onto `to`, overwriting any record `to` held.
    /// When `from` has no record, `to` ends up with none either (rename moves
    /// the whole expiration state, including its absence).
    pub fn transfer(&mut self, from: &[u8], to: &[u8]) {
        match self.deadlines.remove(from) {
            Some(at_ms) => {
                self.deadlines.insert(to.to_vec(), at_ms);
            }
            None => {
                self.deadlines.remove(to);
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.deadlines.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ExpirationTracker, ExpiryState};

    #[test]
    fn unmanaged_key_reports_not_managed() {
        let tracker = ExpirationTracker::new();
        assert_eq!(tracker.state(b"k", 0), ExpiryState::NotManaged);
        assert_eq!(tracker.ttl_seconds(b"k", 0), None);
    }

    #[test]
    fn deadline_transitions_at_the_exact_instant() {
        let mut tracker = ExpirationTracker::new();
        tracker.set_expire_at(b"k", 5_000);
        assert_eq!(tracker.state(b"k", 4_999), ExpiryState::NotExpired);
        assert_eq!(tracker.state(b"k", 5_000), ExpiryState::Expired);
        assert_eq!(tracker.state(b"k", 9_000), ExpiryState::Expired);
    }

    #[test]
    fn ttl_seconds_rounds_up() {
        let mut tracker = ExpirationTracker::new();
        tracker.set_expire_at(b"k", 61_000);
        assert_eq!(tracker.ttl_seconds(b"k", 1_000), Some(60));
        assert_eq!(tracker.ttl_seconds(b"k", 1_001), Some(60));
        assert_eq!(tracker.ttl_seconds(b"k", 60_999), Some(1));
        assert_eq!(tracker.ttl_seconds(b"k", 61_000), Some(0));
    }

    #[test]
    fn clear_reports_whether_a_record_existed() {
        let mut tracker = ExpirationTracker::new();
        assert!(!tracker.clear(b"k"));
        tracker.set_expire_at(b"k", 1_000);
        assert!(tracker.clear(b"k"));
        assert_eq!(tracker.state(b"k", 0), ExpiryState::NotManaged);
    }

    #[test]
    fn transfer_moves_the_record() {
        let mut tracker = ExpirationTracker::new();
        tracker.set_expire_at(b"a", 5_000);
        tracker.transfer(b"a", b"b");
        assert_eq!(tracker.state(b"a", 0), ExpiryState::NotManaged);
        assert_eq!(tracker.deadline_ms(b"b"), Some(5_000));
    }

    #[test]
    fn transfer_from_unmanaged_clears_the_target() {
        let mut tracker = ExpirationTracker::new();
        tracker.set_expire_at(b"b", 5_000);
        tracker.transfer(b"a", b"b");
        assert_eq!(tracker.state(b"b", 0), ExpiryState::NotManaged);
    }

    #[test]
    fn clear_all_empties_the_tracker() {
        let mut tracker = ExpirationTracker::new();
        tracker.set_expire_at(b"a", 1);
        tracker.set_expire_at(b"b", 2);
        tracker.clear_all();
        assert!(tracker.is_empty());
    }
}
