//! Shared primitives for the Cyanea likelihood engine.
//!
//! `cyanea-core` holds what every Cyanea crate agrees on:
//!
//! - **Error types**: [`CyaneaError`] and [`Result`] for structured error handling
//! - **Traits**: [`Checkpointed`] for store/restore participants and
//!   [`Summarizable`] for one-line descriptions

pub mod error;
pub mod traits;

pub use error::{CyaneaError, Result};
pub use traits::*;
