//! The plan state machine: the top-level driver of one execution.
//!
//! [`Executor::run`] validates and defaults the tree, persists it, then
//! advances a [`PlanState`] one step at a time until `End`. Each state is
//! an async method returning the next state; background concurrency only
//! enters through the continuous-check supervisors and the per-block
//! sequence pool. Runtime handles (the plan-level supervisor, the block
//! queue) live on [`Data`], never on the persisted tree.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::model::{
    apply_defaults, validate_plan, Block, CheckScope, FailureReason, Plan, Status,
};
use crate::plugins::PluginRegistry;
use crate::storage::{BlockWriter, PlanStore};

use super::block::{run_block, BlockOutcome};
use super::checks::{run_checks, run_pre_phase, settle_unsupervised, spawn_cont_checks, ContCheckTask};
use super::finalize::finalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanState {
    Start,
    PlanPreChecks,
    PlanStartContChecks,
    ExecuteBlock,
    PlanPostChecks,
    Finalize,
    End,
}

/// Mutable run state threaded between plan states.
struct Data {
    /// Blocks not yet executed, in declaration order.
    pending: VecDeque<Block>,
    /// Blocks already executed (or reached), in declaration order.
    done: Vec<Block>,
    /// The plan-level continuous-check supervisor, while running.
    plan_cont: Option<ContCheckTask>,
    /// First failure reason detected by the runtime; the finalizer's tree
    /// examination never overrides it.
    detected: Option<FailureReason>,
}

/// Executes plans against a storage writer and a plugin registry. One
/// executor serves any number of sequential `run` calls.
pub struct Executor {
    store: Arc<dyn PlanStore>,
    registry: Arc<PluginRegistry>,
}

impl Executor {
    pub fn new(store: Arc<dyn PlanStore>, registry: Arc<PluginRegistry>) -> Self {
        Self { store, registry }
    }

    /// Drive a plan to a terminal status.
    ///
    /// A plan that fails its checks or blocks is a *successful* run: the
    /// failure lives in the returned tree's state and failure reason. An
    /// `Err` is reserved for validation failures, invariant violations,
    /// storage write failures and cancellation of `cancel`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut plan: Plan,
    ) -> Result<Plan, EngineError> {
        apply_defaults(&mut plan);
        validate_plan(&plan, &self.registry)?;
        plan.submit_time = Some(Utc::now());
        self.store.write(&plan).await?;

        let mut data = Data {
            pending: VecDeque::new(),
            done: Vec::new(),
            plan_cont: None,
            detected: None,
        };

        let mut state = PlanState::Start;
        while state != PlanState::End {
            if cancel.is_cancelled() {
                tracing::debug!(plan = %plan.name, "execution canceled");
                self.abort_cleanup(&mut plan, &mut data).await;
                return Err(EngineError::Canceled);
            }
            tracing::debug!(plan = %plan.name, ?state, "entering state");
            state = match self.step(state, &mut plan, &mut data, &cancel).await {
                Ok(next) => next,
                Err(err) => {
                    self.abort_cleanup(&mut plan, &mut data).await;
                    return Err(err);
                }
            };
        }
        Ok(plan)
    }

    async fn step(
        &self,
        state: PlanState,
        plan: &mut Plan,
        data: &mut Data,
        cancel: &CancellationToken,
    ) -> Result<PlanState, EngineError> {
        match state {
            PlanState::Start => self.state_start(plan, data).await,
            PlanState::PlanPreChecks => self.state_plan_pre_checks(plan, data, cancel).await,
            PlanState::PlanStartContChecks => self.state_start_cont_checks(plan, data).await,
            PlanState::ExecuteBlock => self.state_execute_block(plan, data, cancel).await,
            PlanState::PlanPostChecks => self.state_plan_post_checks(plan, data, cancel).await,
            PlanState::Finalize => self.state_finalize(plan, data).await,
            PlanState::End => Ok(PlanState::End),
        }
    }

    async fn state_start(&self, plan: &mut Plan, data: &mut Data) -> Result<PlanState, EngineError> {
        data.pending = std::mem::take(&mut plan.blocks).into();
        plan.state.status = Status::Started;
        plan.state.start = Some(Utc::now());
        self.store.write(plan).await?;
        Ok(PlanState::PlanPreChecks)
    }

    async fn state_plan_pre_checks(
        &self,
        plan: &mut Plan,
        data: &mut Data,
        cancel: &CancellationToken,
    ) -> Result<PlanState, EngineError> {
        if plan.pre_checks.is_some() || plan.cont_checks.is_some() {
            let failed_scope = run_pre_phase(
                &mut plan.pre_checks,
                &mut plan.cont_checks,
                self.store.checks(),
                &self.registry,
                cancel,
            )
            .await?;
            if let Some(scope) = failed_scope {
                data.detected = Some(scope.failure_reason());
                return Ok(PlanState::Finalize);
            }
        }
        Ok(PlanState::PlanStartContChecks)
    }

    async fn state_start_cont_checks(
        &self,
        plan: &mut Plan,
        data: &mut Data,
    ) -> Result<PlanState, EngineError> {
        if let Some(checks) = plan.cont_checks.take() {
            data.plan_cont = Some(spawn_cont_checks(
                checks,
                self.store.checks(),
                self.registry.clone(),
            ));
        }
        plan.state.status = Status::Running;
        self.store.write(plan).await?;
        Ok(PlanState::ExecuteBlock)
    }

    async fn state_execute_block(
        &self,
        plan: &mut Plan,
        data: &mut Data,
        cancel: &CancellationToken,
    ) -> Result<PlanState, EngineError> {
        let Some(mut block) = data.pending.pop_front() else {
            return Ok(PlanState::PlanPostChecks);
        };

        block.state.status = Status::Running;
        block.state.start = Some(Utc::now());
        let writer = self.store.block(block.id);
        writer.write(&block).await?;

        let outcome = run_block(
            &mut block,
            self.store.as_ref(),
            &self.registry,
            cancel,
            data.plan_cont.as_mut(),
        )
        .await;

        // The block is popped and flushed regardless of how it ended.
        if block.state.status.is_terminal() {
            block.state.end = Some(Utc::now());
        }
        let flush = writer.write(&block).await;
        data.done.push(block);
        flush?;

        match outcome? {
            BlockOutcome::Completed => Ok(PlanState::ExecuteBlock),
            BlockOutcome::Failed(reason) => {
                data.detected.get_or_insert(reason);
                Ok(PlanState::Finalize)
            }
            BlockOutcome::PlanContTripped(err) => {
                tracing::warn!("plan continuous checks tripped during block execution: {err}");
                data.detected.get_or_insert(FailureReason::ContCheck);
                Ok(PlanState::Finalize)
            }
        }
    }

    async fn state_plan_post_checks(
        &self,
        plan: &mut Plan,
        data: &mut Data,
        cancel: &CancellationToken,
    ) -> Result<PlanState, EngineError> {
        if let Some(task) = data.plan_cont.take() {
            let (checks, trip) = task.shutdown().await?;
            plan.cont_checks = Some(checks);
            if trip.is_some() {
                data.detected.get_or_insert(FailureReason::ContCheck);
                return Ok(PlanState::Finalize);
            }
        }

        if let Some(post) = plan.post_checks.as_mut() {
            match run_checks(
                post,
                CheckScope::Post,
                self.store.checks(),
                &self.registry,
                cancel,
            )
            .await
            {
                Ok(()) => {}
                Err(err) => match err.into_fatal() {
                    Ok(fatal) => return Err(fatal),
                    Err(_) => {
                        data.detected.get_or_insert(FailureReason::PostCheck);
                    }
                },
            }
        }
        Ok(PlanState::Finalize)
    }

    async fn state_finalize(
        &self,
        plan: &mut Plan,
        data: &mut Data,
    ) -> Result<PlanState, EngineError> {
        // A short-circuit can land here with the supervisor still running;
        // it must be shut down on every path so its channel closes exactly
        // once and its subtree reaches a terminal state.
        if let Some(task) = data.plan_cont.take() {
            let (checks, trip) = task.shutdown().await?;
            plan.cont_checks = Some(checks);
            if trip.is_some() {
                data.detected.get_or_insert(FailureReason::ContCheck);
            }
        }
        if let Some(cont) = plan.cont_checks.as_mut() {
            settle_unsupervised(cont, &self.store.checks()).await?;
        }

        let mut blocks = std::mem::take(&mut data.done);
        blocks.extend(data.pending.drain(..));
        plan.blocks = blocks;

        let result = finalize(plan, data.detected);
        self.store.write(plan).await?;
        result.map(|()| PlanState::End)
    }

    /// Best-effort teardown when a run aborts: stop the supervisor,
    /// reassemble the tree, flush what we have.
    async fn abort_cleanup(&self, plan: &mut Plan, data: &mut Data) {
        if let Some(task) = data.plan_cont.take() {
            if let Ok((checks, _)) = task.shutdown().await {
                plan.cont_checks = Some(checks);
            }
        }
        let mut blocks = std::mem::take(&mut data.done);
        blocks.extend(data.pending.drain(..));
        if !blocks.is_empty() {
            plan.blocks = blocks;
        }
        if let Err(err) = self.store.write(plan).await {
            tracing::warn!("failed to flush plan during abort: {err}");
        }
    }
}
