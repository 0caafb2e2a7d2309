//! Structured error types for the Cyanea ecosystem.

use thiserror::Error;

/// Unified error type for all Cyanea operations.
#[derive(Debug, Error)]
pub enum CyaneaError {
    /// Invalid input (bad arguments, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A caller broke the engine's usage protocol (flipping a static slot,
    /// accepting twice in one round, restoring without a store, ...).
    ///
    /// These are programmer errors and are never recovered locally.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A numerical computation failed in a way retries could not fix.
    #[error("computation failed: {0}")]
    Computation(String),
}

impl CyaneaError {
    /// Shorthand for building an [`CyaneaError::Invariant`].
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// True for protocol violations raised by the caller.
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// Convenience alias used throughout the Cyanea ecosystem.
pub type Result<T> = std::result::Result<T, CyaneaError>;
