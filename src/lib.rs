//! runbook — a hierarchical plan execution engine.
//!
//! A [`Plan`] is a statically-described tree of [`Block`]s, [`Sequence`]s
//! and plugin-backed [`Action`]s, with optional pre/continuous/post check
//! sets at the plan and block level. The [`Executor`] drives a plan to a
//! terminal status: blocks strictly in order, sequences through a bounded
//! worker pool with a tolerated-failures budget, actions with per-attempt
//! timeouts and plugin-defined retry policies, and continuous checks
//! re-running in the background, ready to trip their scope. Every state
//! transition is flushed through the [`storage`] writers before execution
//! proceeds, so external observers can tail a run from storage alone.
//!
//! ```no_run
//! use std::sync::Arc;
//! use runbook::{Executor, MemoryStore, Plan, PluginRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(plan: Plan, registry: PluginRegistry) -> Result<(), runbook::EngineError> {
//! let store = Arc::new(MemoryStore::new());
//! let executor = Executor::new(store, Arc::new(registry));
//! let finished = executor.run(CancellationToken::new(), plan).await?;
//! println!("{} ended {}", finished.name, finished.state.status);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod model;
pub mod plugins;
pub mod storage;

pub use crate::core::Executor;
pub use crate::error::{ActionError, EngineError, StorageError};
pub use crate::model::{
    Action, Attempt, Block, CheckScope, Checks, FailureReason, Plan, Sequence, State, Status,
    ValidationError,
};
pub use crate::plugins::{Plugin, PluginError, PluginRegistry, RetryPolicy};
pub use crate::storage::{
    ActionWriter, BlockWriter, ChecksWriter, EntityRow, MemoryStore, PlanStore, SequenceWriter,
};
