//! In-memory store: the reference implementation of the writer contract.
//!
//! Keeps a row per entity plus the full status history of every flush, so
//! tests and embedding applications can tail a run without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::StorageResult;
use crate::model::{Action, Block, CheckScope, Checks, FailureReason, Plan, Sequence, Status};

use super::{ActionWriter, BlockWriter, ChecksWriter, PlanStore, SequenceWriter};

/// One stored entity row: the durable subset of an entity's state.
#[derive(Debug, Clone)]
pub struct EntityRow {
    pub status: Status,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Attempts recorded so far; zero for non-action entities.
    pub attempts: usize,
    /// Failure reason; only plans carry one.
    pub reason: Option<FailureReason>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<Uuid, EntityRow>,
    history: HashMap<Uuid, Vec<Status>>,
}

impl Tables {
    fn record(&mut self, id: Uuid, row: EntityRow) {
        self.history.entry(id).or_default().push(row.status);
        self.rows.insert(id, row);
    }
}

/// Shared in-memory store. Clones share the same tables; the single lock
/// serializes writes per entity (and, incidentally, across entities).
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest stored row for an entity.
    pub fn row(&self, id: Uuid) -> Option<EntityRow> {
        self.tables.lock().rows.get(&id).cloned()
    }

    /// Every status this entity was flushed with, in write order.
    pub fn status_history(&self, id: Uuid) -> Vec<Status> {
        self.tables
            .lock()
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, id: Uuid, row: EntityRow) {
        self.tables.lock().record(id, row);
    }

    fn record_action(&self, action: &Action) {
        self.record(
            action.id,
            EntityRow {
                status: action.state.status,
                start: action.state.start,
                end: action.state.end,
                attempts: action.attempts.len(),
                reason: None,
            },
        );
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn write(&self, plan: &Plan) -> StorageResult<()> {
        self.record(
            plan.id,
            EntityRow {
                status: plan.state.status,
                start: plan.state.start,
                end: plan.state.end,
                attempts: 0,
                reason: Some(plan.reason),
            },
        );
        Ok(())
    }

    fn checks(&self) -> Arc<dyn ChecksWriter> {
        Arc::new(MemoryChecksWriter {
            store: self.clone(),
        })
    }

    fn block(&self, _id: Uuid) -> Arc<dyn BlockWriter> {
        Arc::new(MemoryBlockWriter {
            store: self.clone(),
        })
    }
}

struct MemoryBlockWriter {
    store: MemoryStore,
}

#[async_trait]
impl BlockWriter for MemoryBlockWriter {
    async fn write(&self, block: &Block) -> StorageResult<()> {
        self.store.record(
            block.id,
            EntityRow {
                status: block.state.status,
                start: block.state.start,
                end: block.state.end,
                attempts: 0,
                reason: None,
            },
        );
        Ok(())
    }

    fn checks(&self) -> Arc<dyn ChecksWriter> {
        Arc::new(MemoryChecksWriter {
            store: self.store.clone(),
        })
    }

    fn sequence(&self, _id: Uuid) -> Arc<dyn SequenceWriter> {
        Arc::new(MemorySequenceWriter {
            store: self.store.clone(),
        })
    }
}

struct MemorySequenceWriter {
    store: MemoryStore,
}

#[async_trait]
impl SequenceWriter for MemorySequenceWriter {
    async fn write(&self, seq: &Sequence) -> StorageResult<()> {
        self.store.record(
            seq.id,
            EntityRow {
                status: seq.state.status,
                start: seq.state.start,
                end: seq.state.end,
                attempts: 0,
                reason: None,
            },
        );
        Ok(())
    }

    fn action(&self) -> Arc<dyn ActionWriter> {
        Arc::new(MemoryActionWriter {
            store: self.store.clone(),
        })
    }
}

struct MemoryChecksWriter {
    store: MemoryStore,
}

#[async_trait]
impl ChecksWriter for MemoryChecksWriter {
    async fn write(&self, checks: &Checks, _scope: CheckScope) -> StorageResult<()> {
        self.store.record(
            checks.id,
            EntityRow {
                status: checks.state.status,
                start: checks.state.start,
                end: checks.state.end,
                attempts: 0,
                reason: None,
            },
        );
        // Check actions are reset and re-run by continuous checks; keep
        // their rows in step with the node.
        for action in &checks.actions {
            self.store.record_action(action);
        }
        Ok(())
    }

    fn action(&self, _scope: CheckScope) -> Arc<dyn ActionWriter> {
        Arc::new(MemoryActionWriter {
            store: self.store.clone(),
        })
    }
}

struct MemoryActionWriter {
    store: MemoryStore,
}

#[async_trait]
impl ActionWriter for MemoryActionWriter {
    async fn write(&self, action: &Action) -> StorageResult<()> {
        self.store.record_action(action);
        Ok(())
    }
}
