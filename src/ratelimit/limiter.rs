//! Process-local token-bucket limiter.
//!
//! Used as the degraded path when the counter store cannot be reached.
//! Buckets are never persisted or shared between processes.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::backend::FallbackLimiter;
use super::rate::{Decision, Rate};
use crate::error::{AdmissionError, Result};

/// How fallback buckets are partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackScope {
    /// One bucket per identifier (and rate)
    #[default]
    PerIdentifier,
    /// One bucket per rate shared by every identifier
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    id: String,
    rate: Rate,
}

type DirectLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// A GCRA bucket that starts full, plus the number of events it let through.
struct Bucket<C: Clock> {
    limiter: DirectLimiter<C>,
    admitted: AtomicU64,
}

impl<C: Clock> Bucket<C> {
    fn acquire(&self, clock: &C) -> Decision {
        match self.limiter.check() {
            Ok(()) => Decision {
                count: self.admitted.fetch_add(1, Ordering::Relaxed) + 1,
                delay: Duration::ZERO,
                allowed: true,
            },
            Err(not_until) => Decision {
                count: self.admitted.load(Ordering::Relaxed),
                delay: not_until.wait_time_from(clock.now()),
                allowed: false,
            },
        }
    }
}

fn quota(rate: &Rate) -> Result<Quota> {
    let burst = NonZeroU32::new(rate.burst())
        .ok_or_else(|| AdmissionError::InvalidRate(format!("{}: burst must be positive", rate)))?;
    let quota = Quota::with_period(rate.interval())
        .ok_or_else(|| {
            AdmissionError::InvalidRate(format!("{}: interval must be positive", rate))
        })?;
    Ok(quota.allow_burst(burst))
}

/// In-memory token buckets keyed by identifier and rate.
///
/// Bucket creation goes through the map's entry API, so two threads racing
/// on a new identifier end up sharing one bucket. Bucket state is a single
/// atomic; unrelated identifiers never contend.
pub struct LocalFallbackLimiter<C: Clock = DefaultClock> {
    rate: Rate,
    scope: FallbackScope,
    buckets: DashMap<BucketKey, Arc<Bucket<C>>>,
    clock: C,
}

impl LocalFallbackLimiter {
    /// Per-identifier buckets at `rate` for fixed-window calls.
    pub fn new(rate: Rate) -> Result<Self> {
        Self::with_scope(rate, FallbackScope::default())
    }

    /// Buckets at `rate`, partitioned by `scope`.
    pub fn with_scope(rate: Rate, scope: FallbackScope) -> Result<Self> {
        Self::with_clock(rate, scope, DefaultClock::default())
    }
}

impl<C: Clock> LocalFallbackLimiter<C> {
    /// Like [`LocalFallbackLimiter::with_scope`], reading time from `clock`.
    pub fn with_clock(rate: Rate, scope: FallbackScope, clock: C) -> Result<Self> {
        rate.validate()?;
        debug!(rate = %rate, scope = ?scope, "Local fallback limiter created");

        Ok(Self {
            rate,
            scope,
            buckets: DashMap::new(),
            clock,
        })
    }

    /// The rate applied to fixed-window calls.
    pub fn rate(&self) -> Rate {
        self.rate
    }

    /// How buckets are partitioned.
    pub fn scope(&self) -> FallbackScope {
        self.scope
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn decide(&self, id: &str, rate: &Rate) -> Decision {
        let quota = match quota(rate) {
            Ok(quota) => quota,
            Err(e) => {
                debug!(id = %id, error = %e, "Fallback asked for an unusable rate");
                return Decision::fail_closed(rate.interval());
            }
        };

        let key = BucketKey {
            id: match self.scope {
                FallbackScope::PerIdentifier => id.to_string(),
                FallbackScope::Global => String::new(),
            },
            rate: *rate,
        };

        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Bucket {
                    limiter: RateLimiter::direct_with_clock(quota, &self.clock),
                    admitted: AtomicU64::new(0),
                })
            })
            .clone();

        let decision = bucket.acquire(&self.clock);
        trace!(
            id = %id,
            allowed = decision.allowed,
            count = decision.count,
            "Local fallback decision"
        );
        decision
    }
}

impl<C> FallbackLimiter for LocalFallbackLimiter<C>
where
    C: Clock + Send + Sync,
    C::Instant: Send + Sync,
{
    fn allow(&self, id: &str) -> Decision {
        let rate = self.rate;
        self.decide(id, &rate)
    }

    fn allow_rate(&self, id: &str, rate: &Rate) -> Decision {
        self.decide(id, rate)
    }
}
