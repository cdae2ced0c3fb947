//! Sharedgate - Distributed Request Admission Control
//!
//! This crate decides whether the next operation for an identifier may
//! proceed under a shared rate budget. Processes coordinate through a shared
//! counter store (memcached, or an in-process store for single nodes), and
//! keep answering in degraded form when that store is unreachable.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sharedgate::{Coordinator, LocalFallbackLimiter, MemcacheConfig, MemcacheStore, Rate};
//!
//! # async fn run() -> sharedgate::error::Result<()> {
//! let store = Arc::new(MemcacheStore::new(MemcacheConfig::new("127.0.0.1:11211")));
//! let fallback = LocalFallbackLimiter::new(Rate::every(Duration::from_secs(1)))?;
//! let gate = Coordinator::new(store).with_fallback(Arc::new(fallback));
//!
//! let decision = gate.allow_minute("user:42", 100).await?;
//! if !decision.allowed {
//!     println!("retry in {:?}", decision.delay);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::Coordinator;
pub use error::{AdmissionError, StoreError};
pub use ratelimit::{
    Decision, FallbackLimiter, FallbackScope, LocalFallbackLimiter, Rate, RateDecision, TimeWindow,
};
pub use store::{CounterStore, MemcacheConfig, MemcacheStore, MemoryStore};
