//! Block execution: pre-phase, continuous-check supervision, the bounded
//! sequence pool with tolerated-failures accounting, and post-checks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, EngineError};
use crate::model::{Block, CheckScope, FailureReason, Sequence, Status};
use crate::plugins::PluginRegistry;
use crate::storage::{BlockWriter, PlanStore};

use super::checks::{
    run_checks, run_pre_phase, settle_unsupervised, spawn_cont_checks, ContCheckTask,
};
use super::sequence::exec_sequence;

/// How one block run ended.
pub(crate) enum BlockOutcome {
    Completed,
    /// The block failed; the reason preserves which phase detected it
    /// (PreCheck/ContCheck/PostCheck) or Block for sequence failures.
    Failed(FailureReason),
    /// The plan-level continuous checks tripped while this block was
    /// executing. The block is marked failed; the caller owns the plan
    /// supervisor and its failure attribution.
    PlanContTripped(ActionError),
}

enum Halt {
    Tolerated,
    BlockCont(ActionError),
    PlanCont(ActionError),
}

/// Drive one block through its phases. Sequences run through a pool of
/// `block.concurrency` workers; a sequence, once admitted, always runs to
/// completion — continuous-check trips and exhausted failure budgets stop
/// *admission*, never in-flight work.
pub(crate) async fn run_block(
    block: &mut Block,
    store: &dyn PlanStore,
    registry: &Arc<PluginRegistry>,
    cancel: &CancellationToken,
    mut plan_cont: Option<&mut ContCheckTask>,
) -> Result<BlockOutcome, EngineError> {
    if !block.entrance_delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Canceled),
            _ = tokio::time::sleep(block.entrance_delay) => {}
        }
    }

    let block_writer = store.block(block.id);
    let checks_writer = block_writer.checks();

    // Pre-checks and the first pass of continuous checks, in parallel.
    if block.pre_checks.is_some() || block.cont_checks.is_some() {
        let failed_scope = run_pre_phase(
            &mut block.pre_checks,
            &mut block.cont_checks,
            checks_writer.clone(),
            registry,
            cancel,
        )
        .await?;
        if let Some(scope) = failed_scope {
            block.state.status = Status::Failed;
            if let Some(cont) = block.cont_checks.as_mut() {
                settle_unsupervised(cont, &checks_writer).await?;
            }
            return Ok(BlockOutcome::Failed(scope.failure_reason()));
        }
    }

    // Hand the continuous set to its supervisor for the duration of the
    // sequence phase.
    let mut block_cont = block
        .cont_checks
        .take()
        .map(|checks| spawn_cont_checks(checks, checks_writer.clone(), registry.clone()));

    let semaphore = Arc::new(Semaphore::new(block.concurrency));
    let failures = Arc::new(AtomicI64::new(0));
    let mut pending: VecDeque<Sequence> = std::mem::take(&mut block.sequences).into();
    let mut tasks: Vec<JoinHandle<(Sequence, Result<(), ActionError>)>> =
        Vec::with_capacity(pending.len());
    let mut halt: Option<Halt> = None;

    while let Some(seq) = pending.pop_front() {
        if block.tolerated_failures >= 0
            && failures.load(Ordering::SeqCst) > block.tolerated_failures as i64
        {
            halt = Some(Halt::Tolerated);
            pending.push_front(seq);
            break;
        }
        if let Some(task) = block_cont.as_mut() {
            if let Some(err) = task.poll_trip() {
                halt = Some(Halt::BlockCont(err));
                pending.push_front(seq);
                break;
            }
        }
        if let Some(task) = plan_cont.as_deref_mut() {
            if let Some(err) = task.poll_trip() {
                halt = Some(Halt::PlanCont(err));
                pending.push_front(seq);
                break;
            }
        }

        let permit = semaphore.clone().acquire_owned().await.unwrap();
        let writer = block_writer.sequence(seq.id);
        let registry = registry.clone();
        let token = cancel.clone();
        let fails = failures.clone();
        let mut seq = seq;
        tasks.push(tokio::spawn(async move {
            let result = exec_sequence(&mut seq, writer, &registry, &token).await;
            if result.is_err() {
                fails.fetch_add(1, Ordering::SeqCst);
            }
            drop(permit);
            (seq, result)
        }));
    }

    // Drain already-admitted sequences and reassemble the tree in order.
    let mut fatal: Option<EngineError> = None;
    let mut executed: Vec<Sequence> = Vec::with_capacity(tasks.len());
    for task in tasks {
        match task.await {
            Ok((seq, result)) => {
                if let Err(ActionError::Fatal(err)) = result {
                    fatal.get_or_insert(err);
                }
                executed.push(seq);
            }
            Err(join_err) => {
                fatal.get_or_insert(EngineError::InternalFailure(format!(
                    "sequence task panicked: {join_err}"
                )));
            }
        }
    }
    block.sequences = executed;
    block.sequences.extend(pending);

    // The admission loop only sees failures that landed before its last
    // check; re-examine the budget now that everything has drained.
    if halt.is_none()
        && block.tolerated_failures >= 0
        && failures.load(Ordering::SeqCst) > block.tolerated_failures as i64
    {
        halt = Some(Halt::Tolerated);
    }

    // Stop the block's continuous checks and consume their final result.
    if let Some(task) = block_cont.take() {
        match task.shutdown().await {
            Ok((checks, trip)) => {
                block.cont_checks = Some(checks);
                if let Some(err) = trip {
                    if halt.is_none() {
                        halt = Some(Halt::BlockCont(err));
                    }
                }
            }
            Err(err) => {
                fatal.get_or_insert(err);
            }
        }
    }
    if let Some(err) = fatal {
        block.state.status = Status::Failed;
        return Err(err);
    }

    if let Some(halt) = halt {
        block.state.status = Status::Failed;
        return Ok(match halt {
            Halt::Tolerated => {
                tracing::debug!(
                    block = %block.name,
                    failures = failures.load(Ordering::SeqCst),
                    "tolerated failure budget exceeded"
                );
                BlockOutcome::Failed(FailureReason::Block)
            }
            Halt::BlockCont(_) => BlockOutcome::Failed(FailureReason::ContCheck),
            Halt::PlanCont(err) => BlockOutcome::PlanContTripped(err),
        });
    }

    // Post-checks only run once every sequence completed and the
    // supervisor has shut down.
    if let Some(post) = block.post_checks.as_mut() {
        match run_checks(post, CheckScope::Post, checks_writer, registry, cancel).await {
            Ok(()) => {}
            Err(err) => {
                return match err.into_fatal() {
                    Ok(fatal) => {
                        block.state.status = Status::Failed;
                        Err(fatal)
                    }
                    Err(_) => {
                        block.state.status = Status::Failed;
                        Ok(BlockOutcome::Failed(FailureReason::PostCheck))
                    }
                };
            }
        }
    }

    if !block.exit_delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Canceled),
            _ = tokio::time::sleep(block.exit_delay) => {}
        }
    }

    if block.state.status != Status::Failed {
        block.state.status = Status::Completed;
    }
    Ok(BlockOutcome::Completed)
}
