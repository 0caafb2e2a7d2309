//! Core trait definitions for the Cyanea ecosystem.
//!
//! These traits define the contracts that domain types implement across crates.

/// A component that takes part in the MCMC store/restore cycle.
///
/// `store_state` snapshots whatever the component needs to roll back to;
/// `restore_state` returns to that snapshot. Only one snapshot is held at a
/// time, and restoring consumes it.
pub trait Checkpointed {
    /// Snapshot the current state, replacing any previous snapshot.
    fn store_state(&mut self) -> crate::Result<()>;

    /// Roll back to the last snapshot.
    ///
    /// The snapshot is consumed rather than swapped with the current state,
    /// so a second restore needs a fresh `store_state` first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CyaneaError::Invariant`] if there is no snapshot to
    /// restore.
    fn restore_state(&mut self) -> crate::Result<()>;

    /// Whether a snapshot is currently held.
    fn has_checkpoint(&self) -> bool;
}

/// A type that can produce a summary of its contents.
pub trait Summarizable {
    /// A one-line summary suitable for display.
    fn summary(&self) -> String;
}
