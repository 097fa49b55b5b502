//! Action-level errors.

use std::time::Duration;

use thiserror::Error;

use super::EngineError;

/// Errors raised while driving a single action (or a check set of actions)
/// to a terminal status. All variants except [`ActionError::Fatal`] are
/// recovered by the caller: they become a `Failed` status on the owning
/// entity and flow into the plan's failure reason.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The plugin returned an error for an attempt.
    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },
    /// The plugin returned a response whose shape does not match its
    /// declared response prototype. Never retried.
    #[error("plugin {plugin} returned {got} but its response prototype is {want}")]
    ResponseType {
        plugin: String,
        got: &'static str,
        want: &'static str,
    },
    /// An attempt exceeded the action's timeout.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The outer execution context was canceled between attempts.
    #[error("action canceled")]
    Canceled,
    /// A fatal condition observed while running the action; propagated out
    /// of the execution instead of being recovered into entity status.
    #[error(transparent)]
    Fatal(#[from] EngineError),
}

impl ActionError {
    /// Split off the fatal case so callers can recover everything else.
    pub fn into_fatal(self) -> Result<EngineError, ActionError> {
        match self {
            ActionError::Fatal(e) => Ok(e),
            other => Err(other),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ActionError::Fatal(_))
    }
}
