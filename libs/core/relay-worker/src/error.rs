//! Error types and error categorization
//!
//! Errors are categorized so the worker can map them onto result codes:
//! - **Transient**: dependency call failed or timed out, retried per policy
//! - **CircuitOpen**: dependency guard is open, fail fast
//! - **Cancelled**: shutdown interrupted the operation
//! - **Permanent**: misconfiguration or broken plumbing

use thiserror::Error;

/// Result code attached to results whose dependency call exhausted its retries.
pub const CODE_DEPENDENCY_ERROR: &str = "DEPENDENCY_ERROR";
/// Result code attached to results short-circuited by an open breaker.
pub const CODE_CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
/// Result code attached to results cut short by shutdown.
pub const CODE_CANCELLED: &str = "CANCELLED";

/// Category of error for mapping failures onto results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure of a dependency
    Transient,
    /// Circuit breaker rejected the call
    CircuitOpen,
    /// Shutdown interrupted the operation
    Cancelled,
    /// Unrecoverable error
    Permanent,
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum RelayError {
    /// Upstream source failed to deliver an item
    #[error("Source error: {0}")]
    Source(String),

    /// Dependency call failed
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Subscriber transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broadcast hub is no longer running
    #[error("Broadcast hub stopped")]
    HubStopped,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl RelayError {
    /// Create a dependency error
    pub fn dependency(message: impl Into<String>) -> Self {
        RelayError::Dependency(message.into())
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::Source(_) => ErrorCategory::Transient,
            RelayError::Dependency(_) => ErrorCategory::Transient,
            RelayError::Serialization(_) => ErrorCategory::Permanent,
            RelayError::Transport(_) => ErrorCategory::Permanent,
            RelayError::HubStopped => ErrorCategory::Permanent,
            RelayError::Internal(_) => ErrorCategory::Permanent,
            RelayError::Shutdown => ErrorCategory::Cancelled,
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization(err.to_string())
    }
}
