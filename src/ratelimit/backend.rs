//! Fallback limiter trait.

use super::rate::{Decision, Rate};

/// A process-local limiter consulted when the shared store is unavailable.
///
/// This trait abstracts over the bundled [`super::LocalFallbackLimiter`]
/// so a [`crate::Coordinator`] can defer to any in-process policy.
/// Decisions must be immediate and must not touch the network.
pub trait FallbackLimiter: Send + Sync {
    /// Decide for a fixed-window call on `id` using the limiter's own rate.
    fn allow(&self, id: &str) -> Decision;

    /// Decide for a continuous-rate call on `id` at `rate`.
    fn allow_rate(&self, id: &str, rate: &Rate) -> Decision;
}
