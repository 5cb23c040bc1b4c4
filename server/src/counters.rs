//! Connection counters backing the account-limit and rate-limit checks

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live authenticated connections per address.
///
/// Counts never go below zero and an address is dropped from the map as soon
/// as its count reaches zero.
#[derive(Debug, Default)]
pub struct AccountLimitCounter {
    connections: DashMap<IpAddr, u64>,
}

impl AccountLimitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count after incrementing.
    pub fn increment(&self, address: IpAddr) -> u64 {
        let mut count = self.connections.entry(address).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the count after decrementing.
    pub fn decrement(&self, address: IpAddr) -> u64 {
        match self.connections.entry(address) {
            Entry::Occupied(mut entry) => {
                if *entry.get() <= 1 {
                    entry.remove();
                    0
                } else {
                    *entry.get_mut() -= 1;
                    *entry.get()
                }
            }
            Entry::Vacant(_) => {
                debug!("Ignoring decrement for {} with no live connections", address);
                0
            }
        }
    }

    pub fn connections(&self, address: IpAddr) -> u64 {
        self.connections.get(&address).map_or(0, |count| *count)
    }

    /// Number of addresses with at least one live connection.
    pub fn tracked_addresses(&self) -> usize {
        self.connections.len()
    }
}

/// Connection attempts since the last reset tick.
#[derive(Debug, Default)]
pub struct RateLimitCounter {
    attempts: AtomicU64,
}

impl RateLimitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one attempt and returns the total for the current window.
    pub fn record_attempt(&self) -> u64 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Starts a new window, returning the count of the one that ended.
    pub fn reset(&self) -> u64 {
        self.attempts.swap(0, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_increment_and_decrement() {
        let counter = AccountLimitCounter::new();
        assert_eq!(counter.increment(addr("10.0.0.1")), 1);
        assert_eq!(counter.increment(addr("10.0.0.1")), 2);
        assert_eq!(counter.connections(addr("10.0.0.1")), 2);

        assert_eq!(counter.decrement(addr("10.0.0.1")), 1);
        assert_eq!(counter.connections(addr("10.0.0.1")), 1);
    }

    #[test]
    fn test_entry_removed_at_zero() {
        let counter = AccountLimitCounter::new();
        counter.increment(addr("10.0.0.1"));
        counter.decrement(addr("10.0.0.1"));

        assert_eq!(counter.connections(addr("10.0.0.1")), 0);
        assert_eq!(counter.tracked_addresses(), 0);
    }

    #[test]
    fn test_decrement_floors_at_zero() {
        let counter = AccountLimitCounter::new();
        assert_eq!(counter.decrement(addr("10.0.0.1")), 0);
        assert_eq!(counter.decrement(addr("10.0.0.1")), 0);
        assert_eq!(counter.tracked_addresses(), 0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counter = Arc::new(AccountLimitCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment(addr("10.0.0.1"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.connections(addr("10.0.0.1")), 8000);
    }

    #[test]
    fn test_rate_counter_window() {
        let counter = RateLimitCounter::new();
        assert_eq!(counter.record_attempt(), 1);
        assert_eq!(counter.record_attempt(), 2);
        assert_eq!(counter.current(), 2);

        assert_eq!(counter.reset(), 2);
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.record_attempt(), 1);
    }
}
