//! In-process counter store.
//!
//! Useful for single-node deployments and for tests. Entries expire lazily:
//! an expired entry is treated as absent the next time it is touched. Every
//! window creates a fresh key, so the store also sweeps expired entries after
//! a fixed number of writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::trace;

use super::{CounterStore, StoredValue};
use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;

/// Expiry used when `now + ttl` does not fit in a `SystemTime`.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

/// Writes between two sweeps of expired entries.
const DEFAULT_WRITES_BEFORE_SWEEP: u64 = 1024;

fn expiry(now: SystemTime, ttl: Duration) -> SystemTime {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FOREVER))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: u64,
    version: u64,
    expires_at: SystemTime,
}

impl Entry {
    fn is_live(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

/// A thread-safe in-memory [`CounterStore`].
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    next_version: AtomicU64,
    writes: AtomicU64,
    writes_before_sweep: u64,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store that evaluates expiry against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            next_version: AtomicU64::new(1),
            writes: AtomicU64::new(0),
            writes_before_sweep: DEFAULT_WRITES_BEFORE_SWEEP,
            clock,
        }
    }

    /// Sweep expired entries every `writes` writes instead of the default.
    pub fn with_sweep_interval(mut self, writes: u64) -> Self {
        self.writes_before_sweep = writes.max(1);
        self
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }

    /// Count a write and sweep when due. Must not run while an entry is held.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.writes_before_sweep == 0 {
            let removed = self.purge_expired();
            if removed > 0 {
                trace!(removed = removed, remaining = self.entries.len(), "Swept expired counters");
            }
        }
    }

    fn version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    fn fresh(&self, value: u64, now: SystemTime, ttl: Duration) -> Entry {
        Entry {
            value,
            version: self.version(),
            expires_at: expiry(now, ttl),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let value = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let version = self.version();
                let entry = occupied.get_mut();
                if entry.is_live(now) {
                    entry.value = entry.value.saturating_add(delta);
                    entry.version = version;
                } else {
                    trace!(key = %key, "Expired counter recreated");
                    *entry = Entry {
                        value: delta,
                        version,
                        expires_at: expiry(now, ttl),
                    };
                }
                entry.value
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(self.fresh(delta, now, ttl));
                delta
            }
        };
        self.record_write();
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| StoredValue {
                value: entry.value,
                version: entry.version,
            }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        current: Option<&StoredValue>,
        new: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let swapped = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now);
                let matches = match current {
                    Some(expected) => live && occupied.get().version == expected.version,
                    None => !live,
                };
                if matches {
                    occupied.insert(self.fresh(new, now, ttl));
                }
                matches
            }
            MapEntry::Vacant(vacant) => {
                if current.is_none() {
                    vacant.insert(self.fresh(new, now, ttl));
                }
                current.is_none()
            }
        };
        if swapped {
            self.record_write();
        }
        Ok(swapped)
    }

    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        let now = self.clock.now();
        let entry = self.fresh(value, now, ttl);
        self.entries.insert(key.to_string(), entry);
        self.record_write();
        Ok(())
    }
}
