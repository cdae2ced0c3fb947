//! Continuous-rate limiting over the shared store.
//!
//! Each `(identifier, rate)` pair owns a single stored scalar: the
//! theoretical arrival time (TAT) of the next event, in nanoseconds since
//! the UNIX epoch. An event is admitted iff `now >= TAT - burst_allowance`;
//! admission advances the TAT to `max(TAT, now) + interval` through a
//! compare-and-swap, so concurrent processes never lose an update.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::rate::{nanos, Rate, RateDecision};
use crate::clock::Clock;
use crate::error::{AdmissionError, Result};
use crate::store::{CounterStore, StoreKey};

/// Default bound on compare-and-swap attempts per decision.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 8;

/// A GCRA rate limiter whose state is shared through a [`CounterStore`].
pub struct DistributedRateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    max_cas_retries: u32,
}

impl DistributedRateLimiter {
    /// Create a new distributed rate limiter.
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            prefix: prefix.into(),
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    /// Bound the compare-and-swap loop. At least one attempt is always made.
    pub fn with_max_cas_retries(mut self, max_cas_retries: u32) -> Self {
        self.max_cas_retries = max_cas_retries.max(1);
        self
    }

    /// Check whether `id` may perform one more event under `rate`.
    ///
    /// Returns [`AdmissionError::CasExhausted`] if every compare-and-swap lost
    /// to a concurrent writer; callers treat that like an unavailable store.
    pub async fn allow_rate(&self, id: &str, rate: &Rate) -> Result<RateDecision> {
        rate.validate()?;

        let key = StoreKey::rate(&self.prefix, id, rate);
        let interval = nanos(rate.interval());
        let allowance = nanos(rate.burst_allowance());
        let span = rate.span();

        for attempt in 1..=self.max_cas_retries {
            let observed = self.store.get(key.as_str()).await?;
            let now = self.clock.now_nanos();
            let tat = observed.map(|stored| stored.value).unwrap_or(now);
            let allow_at = tat.saturating_sub(allowance);

            trace!(key = %key, tat = tat, now = now, attempt = attempt, "Checking rate");

            if now < allow_at {
                // Clock skew between writers must not produce absurd hints
                let delay = Duration::from_nanos(allow_at - now).min(span);
                debug!(key = %key, delay = ?delay, "Rate limit exceeded");
                return Ok(RateDecision::denied(delay));
            }

            let new_tat = tat.max(now).saturating_add(interval);
            let ttl = Duration::from_nanos(new_tat - now)
                .saturating_add(rate.burst_allowance())
                .max(rate.interval());

            if self
                .store
                .compare_and_swap(key.as_str(), observed.as_ref(), new_tat, ttl)
                .await?
            {
                return Ok(RateDecision::allowed());
            }

            trace!(key = %key, attempt = attempt, "Lost compare-and-swap race");
        }

        debug!(key = %key, attempts = self.max_cas_retries, "Compare-and-swap retries exhausted");
        Err(AdmissionError::CasExhausted {
            attempts: self.max_cas_retries,
        })
    }

    /// Make the bucket for `(id, rate)` fully available again.
    pub async fn reset_rate(&self, id: &str, rate: &Rate) -> Result<()> {
        rate.validate()?;

        let key = StoreKey::rate(&self.prefix, id, rate);
        debug!(key = %key, "Resetting rate state");

        self.store
            .set(key.as_str(), self.clock.now_nanos(), rate.span())
            .await?;
        Ok(())
    }
}
