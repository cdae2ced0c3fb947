//! Continuous rates and decision results.

use std::fmt;
use std::time::Duration;

use crate::error::{AdmissionError, Result};

/// A continuous rate: one event per `interval`, with up to `burst` events
/// admitted back to back from a rested bucket.
///
/// ```
/// use sharedgate::Rate;
/// use std::time::Duration;
///
/// let rate = Rate::per_second(10);
/// assert_eq!(rate.interval(), Duration::from_millis(100));
///
/// let bursty = Rate::every(Duration::from_secs(1)).with_burst(5);
/// assert_eq!(bursty.burst_allowance(), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rate {
    interval: Duration,
    burst: u32,
}

impl Rate {
    /// One event every `interval`, no burst.
    pub fn every(interval: Duration) -> Self {
        Self { interval, burst: 1 }
    }

    /// `count` events spread evenly over `period`.
    ///
    /// A zero `count` yields a rate that fails [`Rate::validate`].
    pub fn per_period(count: u32, period: Duration) -> Self {
        Self::every(period.checked_div(count).unwrap_or(Duration::ZERO))
    }

    /// `count` events per second.
    pub fn per_second(count: u32) -> Self {
        Self::per_period(count, Duration::from_secs(1))
    }

    /// `count` events per minute.
    pub fn per_minute(count: u32) -> Self {
        Self::per_period(count, Duration::from_secs(60))
    }

    /// `count` events per hour.
    pub fn per_hour(count: u32) -> Self {
        Self::per_period(count, Duration::from_secs(3600))
    }

    /// Allow `burst` events at once from a rested bucket.
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    /// Time between two events at the sustained rate.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// How far ahead of "now" the theoretical arrival time may run while
    /// still admitting an event.
    pub fn burst_allowance(&self) -> Duration {
        self.interval
            .checked_mul(self.burst.saturating_sub(1))
            .unwrap_or(Duration::MAX)
    }

    /// Time for an empty bucket to refill completely.
    pub fn span(&self) -> Duration {
        self.interval
            .checked_mul(self.burst)
            .unwrap_or(Duration::MAX)
    }

    /// Reject rates no bucket can honour.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AdmissionError::InvalidRate(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.burst == 0 {
            return Err(AdmissionError::InvalidRate(
                "burst must be at least one".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1/{:?} (burst {})", self.interval, self.burst)
    }
}

/// Outcome of a fixed-window or fallback admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Counter value after this call: attempted volume, denied calls included
    pub count: u64,
    /// How long until capacity frees up (time to window reset, or to the next token)
    pub delay: Duration,
    /// Whether the request may proceed
    pub allowed: bool,
}

impl Decision {
    /// The decision returned when the store is down and no fallback exists.
    pub fn fail_closed(delay: Duration) -> Self {
        Self {
            count: 0,
            delay,
            allowed: false,
        }
    }
}

/// Outcome of a continuous-rate admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Zero when allowed; otherwise how long until the next event would be admitted
    pub delay: Duration,
    /// Whether the request may proceed
    pub allowed: bool,
}

impl RateDecision {
    pub(crate) fn allowed() -> Self {
        Self {
            delay: Duration::ZERO,
            allowed: true,
        }
    }

    pub(crate) fn denied(delay: Duration) -> Self {
        Self {
            delay,
            allowed: false,
        }
    }
}

impl From<Decision> for RateDecision {
    fn from(decision: Decision) -> Self {
        Self {
            delay: decision.delay,
            allowed: decision.allowed,
        }
    }
}

/// Saturating `Duration` to nanoseconds.
pub(crate) fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
