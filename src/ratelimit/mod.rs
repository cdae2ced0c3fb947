//! Admission algorithms.

mod backend;
mod counter;
mod distributed;
mod limiter;
mod rate;

pub use backend::FallbackLimiter;
pub use counter::{FixedWindowLimiter, TimeWindow, WindowSpan};
pub use distributed::{DistributedRateLimiter, DEFAULT_MAX_CAS_RETRIES};
pub use limiter::{FallbackScope, LocalFallbackLimiter};
pub use rate::{Decision, Rate, RateDecision};
