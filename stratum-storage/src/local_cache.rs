//! In-process cache tier.
//!
//! A concurrent map with per-cache TTL, lazy expiry on read, and a periodic
//! sweep whose per-pass work is capped at the soft capacity. The capacity
//! is a bound on sweep latency, not a hard size limit: a burst of inserts
//! between sweeps can transiently exceed it. Values are stored as plain
//! strings; the tiered layer above decides what goes in.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// Result of one [`LocalCache::sweep`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Entries visited this pass (at most the soft capacity)
    pub visited: usize,
    /// Visited entries removed because their TTL elapsed
    pub expired: usize,
}

/// Concurrent in-process cache with TTL and a soft capacity bound.
pub struct LocalCache {
    entries: DashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
}

impl LocalCache {
    /// A TTL of zero means entries never expire.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Look up a key, lazily removing it when expired.
    pub fn get(&self, key: &str) -> Option<String> {
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(Instant::now()) {
                return Some(entry.value.clone());
            }
        }
        // Guard dropped above; removing while holding it would deadlock.
        self.entries
            .remove_if(key, |_, entry| entry.is_expired(Instant::now()));
        None
    }

    /// Insert or replace a key with the cache-wide TTL.
    pub fn set(&self, key: &str, value: &str) {
        let expires_at = if self.ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + self.ttl)
        };
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One bounded eviction pass: visit at most `capacity` entries and
    /// remove the expired ones among them. Entries beyond the cap wait for
    /// the next pass (or for lazy expiry on read).
    pub fn sweep(&self) -> SweepStats {
        let now = Instant::now();
        let mut stats = SweepStats::default();

        let mut expired_keys = Vec::new();
        for entry in self.entries.iter() {
            if stats.visited >= self.capacity {
                break;
            }
            stats.visited += 1;
            if entry.is_expired(now) {
                expired_keys.push(entry.key().clone());
            }
        }

        for key in expired_keys {
            if self
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                stats.expired += 1;
            }
        }

        if stats.expired > 0 {
            debug!(
                "Local cache sweep: {} visited, {} expired, {} remain",
                stats.visited,
                stats.expired,
                self.entries.len()
            );
        }
        stats
    }
}
