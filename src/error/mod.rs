//! Error types for the execution engine.
//!
//! - [`ActionError`] — Failures raised while driving a single action or
//!   check set; recovered locally into entity status.
//! - [`EngineError`] — Fatal errors that surface from
//!   [`Executor::run`](crate::core::Executor::run): validation, invariant
//!   violations, storage write failures, cancellation.

mod action_error;
mod engine_error;

pub use action_error::ActionError;
pub use engine_error::{EngineError, StorageError};

/// Convenience alias for storage-layer results.
pub type StorageResult<T> = Result<T, StorageError>;
