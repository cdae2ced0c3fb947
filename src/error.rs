//! Error types for sharedgate.

use thiserror::Error;

/// Failure talking to the shared counter store.
///
/// Every variant is treated the same way by the limiters: the store is
/// considered unavailable for this call.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection or socket errors
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store did not answer within the configured timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Unexpected or error reply from the store
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// A stored value could not be decoded
    #[error("store value is not a counter: {0}")]
    Parse(String),

    /// The key cannot be represented on the wire
    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

/// Main error type for admission decisions.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// The counter store could not be reached or gave an unusable answer
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// The compare-and-swap loop lost every race it ran
    #[error("gave up after {attempts} conflicting compare-and-swap attempts")]
    CasExhausted { attempts: u32 },

    /// Window durations must be positive
    #[error("window must be greater than zero")]
    InvalidWindow,

    /// Rates must have a positive interval and burst
    #[error("invalid rate: {0}")]
    InvalidRate(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Whether this error means the shared store could not produce a decision.
    ///
    /// These are the errors the coordinator recovers from with its fallback
    /// policy. Misuse errors are never recovered.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AdmissionError::StoreUnavailable(_) | AdmissionError::CasExhausted { .. }
        )
    }
}

/// Result type alias for sharedgate operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;
