//! Durable storage of plan state.
//!
//! The engine never reads from storage; it writes through a hierarchy of
//! writers keyed by entity, flushing every state transition before
//! execution proceeds. That write-through is the sole mechanism by which
//! external observers tail a running plan. A failed write is fatal to the
//! execution.
//!
//! Implementations must serialize writes per entity; the engine may flush
//! sibling entities concurrently (e.g. check actions running in parallel)
//! but never issues overlapping writes for the same entity.

mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::model::{Action, Block, CheckScope, Checks, Plan, Sequence};

pub use memory::{EntityRow, MemoryStore};

/// Root writer for one plan.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Flush the plan's own row (status, timestamps, failure reason).
    async fn write(&self, plan: &Plan) -> StorageResult<()>;

    /// Writer for the plan-level check sets.
    fn checks(&self) -> Arc<dyn ChecksWriter>;

    /// Writer for one block of the plan.
    fn block(&self, id: Uuid) -> Arc<dyn BlockWriter>;
}

#[async_trait]
pub trait BlockWriter: Send + Sync {
    async fn write(&self, block: &Block) -> StorageResult<()>;

    /// Writer for the block-level check sets.
    fn checks(&self) -> Arc<dyn ChecksWriter>;

    /// Writer for one sequence of the block.
    fn sequence(&self, id: Uuid) -> Arc<dyn SequenceWriter>;
}

#[async_trait]
pub trait SequenceWriter: Send + Sync {
    async fn write(&self, seq: &Sequence) -> StorageResult<()>;

    /// Writer for the sequence's actions.
    fn action(&self) -> Arc<dyn ActionWriter>;
}

#[async_trait]
pub trait ChecksWriter: Send + Sync {
    /// Flush a check set's node row.
    async fn write(&self, checks: &Checks, scope: CheckScope) -> StorageResult<()>;

    /// Writer for the check set's actions at the given scope.
    fn action(&self, scope: CheckScope) -> Arc<dyn ActionWriter>;
}

#[async_trait]
pub trait ActionWriter: Send + Sync {
    async fn write(&self, action: &Action) -> StorageResult<()>;
}
