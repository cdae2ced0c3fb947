//! Fixed-window counting over the shared store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::rate::{nanos, Decision};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::store::{CounterStore, StoreKey};

/// Named window lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

impl From<TimeWindow> for Duration {
    fn from(window: TimeWindow) -> Self {
        window.duration()
    }
}

/// Position of an instant inside the grid of aligned windows.
///
/// Windows start at multiples of their length since the UNIX epoch, so every
/// process sharing a store agrees on the boundaries without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSpan {
    /// Number of whole windows since the epoch
    pub index: u64,
    /// Time left until this window ends; in `(0, window]`
    pub remaining: Duration,
}

impl WindowSpan {
    /// Locate `now_nanos` in windows of length `window`.
    pub fn at(now_nanos: u64, window: Duration) -> Self {
        let width = nanos(window).max(1);
        let index = now_nanos / width;
        let elapsed = now_nanos % width;

        Self {
            index,
            remaining: Duration::from_nanos(width - elapsed),
        }
    }
}

/// Counts events per identifier in fixed windows.
///
/// The count lives in the shared store, so every process using the same
/// store and key prefix sees the same occupancy.
pub struct FixedWindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl FixedWindowLimiter {
    /// Create a limiter over `store`.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
        }
    }

    /// Record one event for `id` and check it against `limit` events per `window`.
    pub async fn allow(&self, id: &str, limit: u64, window: Duration) -> Result<Decision> {
        self.allow_n(id, limit, 1, window).await
    }

    /// Record `hits` events for `id` and check the total against `limit`.
    ///
    /// The call is allowed iff the counter after incrementing is at most
    /// `limit`. Denied calls still count.
    pub async fn allow_n(
        &self,
        id: &str,
        limit: u64,
        hits: u64,
        window: Duration,
    ) -> Result<Decision> {
        if window.is_zero() {
            return Err(AdmissionError::InvalidWindow);
        }

        let span = WindowSpan::at(self.clock.now_nanos(), window);
        let key = StoreKey::window(&self.prefix, id, window, span.index);

        trace!(key = %key, hits = hits, limit = limit, "Checking fixed window");

        let count = self
            .store
            .increment_with_expiry(key.as_str(), hits, window)
            .await?;
        let allowed = count <= limit;

        if !allowed {
            debug!(
                key = %key,
                count = count,
                limit = limit,
                "Fixed window limit exceeded"
            );
        }

        Ok(Decision {
            count,
            delay: span.remaining,
            allowed,
        })
    }

    /// Zero the current window's counter for `id`.
    pub async fn reset(&self, id: &str, window: Duration) -> Result<()> {
        if window.is_zero() {
            return Err(AdmissionError::InvalidWindow);
        }

        let span = WindowSpan::at(self.clock.now_nanos(), window);
        let key = StoreKey::window(&self.prefix, id, window, span.index);
        debug!(key = %key, "Resetting fixed window");

        self.store.set(key.as_str(), 0, window).await?;
        Ok(())
    }
}
