//! Admission coordinator.
//!
//! The façade callers talk to. It routes each request to the fixed-window or
//! continuous-rate limiter and owns the policy for a store outage: deny
//! outright (fail closed, the default) or defer to a local fallback limiter
//! (fail open, opt-in).

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{LimiterConfig, SharedgateConfig, StoreBackend};
use crate::error::{AdmissionError, Result};
use crate::ratelimit::{
    Decision, DistributedRateLimiter, FallbackLimiter, FixedWindowLimiter, LocalFallbackLimiter,
    Rate, RateDecision, TimeWindow,
};
use crate::store::{CounterStore, MemcacheStore, MemoryStore};

/// Shared admission decisions with a configurable outage policy.
///
/// Every `allow*` call makes exactly one logical trip to the store. Nothing
/// is cached between calls and the coordinator never retries on its own.
pub struct Coordinator {
    windows: FixedWindowLimiter,
    rates: DistributedRateLimiter,
    fallback: Option<Arc<dyn FallbackLimiter>>,
}

impl Coordinator {
    /// Create a coordinator over `store` with default settings and no fallback.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_config(store, &LimiterConfig::default(), Arc::new(SystemClock::new()))
    }

    /// Create a coordinator over `store` with explicit tuning and clock.
    pub fn with_config(
        store: Arc<dyn CounterStore>,
        config: &LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            windows: FixedWindowLimiter::new(
                store.clone(),
                clock.clone(),
                config.key_prefix.clone(),
            ),
            rates: DistributedRateLimiter::new(store, clock, config.key_prefix.clone())
                .with_max_cas_retries(config.max_cas_retries),
            fallback: None,
        }
    }

    /// Build the store, limiters and fallback described by `config`.
    pub fn from_config(config: &SharedgateConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn CounterStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Memcache => Arc::new(MemcacheStore::new(config.store.memcache.clone())),
        };

        let mut coordinator =
            Self::with_config(store, &config.limiter, Arc::new(SystemClock::new()));

        if config.fallback.enabled {
            let local =
                LocalFallbackLimiter::with_scope(config.fallback.rate(), config.fallback.scope)?;
            coordinator.set_fallback(Arc::new(local));
        }

        info!(
            backend = ?config.store.backend,
            key_prefix = %config.limiter.key_prefix,
            fallback = coordinator.fallback_enabled(),
            "Coordinator initialized"
        );

        Ok(coordinator)
    }

    /// Attach a fallback limiter, switching the outage policy to fail open.
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackLimiter>) -> Self {
        self.set_fallback(fallback);
        self
    }

    /// Attach or replace the fallback limiter.
    pub fn set_fallback(&mut self, fallback: Arc<dyn FallbackLimiter>) {
        self.fallback = Some(fallback);
    }

    /// Remove the fallback limiter, switching the outage policy back to fail closed.
    pub fn clear_fallback(&mut self) {
        self.fallback = None;
    }

    /// Whether store outages are answered by a fallback limiter.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback.is_some()
    }

    /// Record one event for `id` and check it against `limit` events per `window`.
    ///
    /// The returned `count` is the attempted volume in the current window,
    /// including this call even when it is denied. `delay` is the time until
    /// the window resets.
    pub async fn allow(&self, id: &str, limit: u64, window: Duration) -> Result<Decision> {
        self.allow_n(id, limit, 1, window).await
    }

    /// Record `hits` events for `id` and check the total against `limit` per `window`.
    pub async fn allow_n(
        &self,
        id: &str,
        limit: u64,
        hits: u64,
        window: Duration,
    ) -> Result<Decision> {
        match self.windows.allow_n(id, limit, hits, window).await {
            Ok(decision) => Ok(decision),
            Err(e) if e.is_unavailable() => Ok(self.degraded(id, window, &e)),
            Err(e) => Err(e),
        }
    }

    /// [`Coordinator::allow`] over a named window.
    pub async fn allow_window(&self, id: &str, limit: u64, window: TimeWindow) -> Result<Decision> {
        self.allow(id, limit, window.duration()).await
    }

    /// [`Coordinator::allow`] over a one-minute window.
    pub async fn allow_minute(&self, id: &str, limit: u64) -> Result<Decision> {
        self.allow_window(id, limit, TimeWindow::Minute).await
    }

    /// [`Coordinator::allow`] over a one-hour window.
    pub async fn allow_hour(&self, id: &str, limit: u64) -> Result<Decision> {
        self.allow_window(id, limit, TimeWindow::Hour).await
    }

    /// Check whether `id` may perform one more event under `rate`.
    pub async fn allow_rate(&self, id: &str, rate: &Rate) -> Result<RateDecision> {
        match self.rates.allow_rate(id, rate).await {
            Ok(decision) => Ok(decision),
            Err(e) if e.is_unavailable() => Ok(self.degraded_rate(id, rate, &e)),
            Err(e) => Err(e),
        }
    }

    /// Zero the current window's counter for `id`.
    ///
    /// Store failures are returned to the caller; there is no fallback for
    /// administrative writes.
    pub async fn reset(&self, id: &str, window: Duration) -> Result<()> {
        self.windows.reset(id, window).await
    }

    /// Make the bucket for `(id, rate)` fully available again.
    pub async fn reset_rate(&self, id: &str, rate: &Rate) -> Result<()> {
        self.rates.reset_rate(id, rate).await
    }

    fn degraded(&self, id: &str, window: Duration, cause: &AdmissionError) -> Decision {
        match &self.fallback {
            Some(fallback) => {
                warn!(id = %id, error = %cause, "Counter store unavailable, using local fallback");
                fallback.allow(id)
            }
            None => {
                warn!(id = %id, error = %cause, "Counter store unavailable, denying");
                Decision::fail_closed(window)
            }
        }
    }

    fn degraded_rate(&self, id: &str, rate: &Rate, cause: &AdmissionError) -> RateDecision {
        match &self.fallback {
            Some(fallback) => {
                warn!(
                    id = %id,
                    rate = %rate,
                    error = %cause,
                    "Counter store unavailable, using local fallback"
                );
                fallback.allow_rate(id, rate).into()
            }
            None => {
                warn!(id = %id, rate = %rate, error = %cause, "Counter store unavailable, denying");
                RateDecision::denied(rate.interval())
            }
        }
    }
}
