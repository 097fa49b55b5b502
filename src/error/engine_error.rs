//! Fatal engine errors.

use thiserror::Error;
use uuid::Uuid;

use crate::model::ValidationError;

/// Errors that abort an execution. A plan that merely fails its checks or
/// blocks does not produce one of these; that outcome is carried in the
/// plan's own state and failure reason.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("plugin {0:?} is not registered")]
    PluginNotFound(String),
    #[error("internal invariant violation: {0}")]
    InternalFailure(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("execution canceled")]
    Canceled,
}

/// A storage write failed. Every state transition is flushed through the
/// store before execution proceeds, so a failed write is always fatal.
#[derive(Debug, Error)]
#[error("storage write for {entity} {id} failed: {message}")]
pub struct StorageError {
    pub entity: &'static str,
    pub id: Uuid,
    pub message: String,
}

impl StorageError {
    pub fn new(entity: &'static str, id: Uuid, message: impl Into<String>) -> Self {
        Self {
            entity,
            id,
            message: message.into(),
        }
    }
}
