//! Shared counter store abstraction.
//!
//! The admission algorithms only need a handful of atomic primitives from the
//! store: increment-with-expiry for fixed windows, and get plus
//! compare-and-swap for the rate state. Any key-value service offering these
//! can back a [`crate::Coordinator`].

#[cfg(test)]
pub(crate) mod fake_memcached;
mod key;
mod memcache;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub(crate) use key::is_key_safe;
pub use key::{StoreKey, DEFAULT_PREFIX, MAX_PREFIX_LEN};
pub use memcache::{MemcacheConfig, MemcacheStore};
pub use memory::MemoryStore;

/// A value read from the store together with its compare-and-swap token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredValue {
    /// The stored integer
    pub value: u64,
    /// Opaque version token; changes on every write to the key
    pub version: u64,
}

/// Trait for shared counter stores.
///
/// Implementations must be safe to call concurrently from many tasks and
/// must report every network, timeout or protocol failure as a
/// [`StoreError`].
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `delta` to the counter at `key` and return the new value.
    ///
    /// A missing key is created at zero first, and only then is its expiry set
    /// to `ttl`. Later increments never move the expiry.
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: u64,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Read the value at `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<StoredValue>, StoreError>;

    /// Replace the value at `key` if nobody else wrote it since `current` was read.
    ///
    /// With `current == None` the write succeeds only if the key is absent.
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &str,
        current: Option<&StoredValue>,
        new: u64,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Unconditionally write `value` at `key` with a fresh expiry.
    async fn set(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;
}
