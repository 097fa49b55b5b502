//! Check execution: the parallel check runner and the continuous-check
//! supervisor.
//!
//! A continuous-check supervisor is a background task owning its Checks
//! subtree for the duration of a scope (plan or block). It publishes at
//! most one terminal value on a capacity-1 channel — the first tick
//! failure — and otherwise exits silently when canceled; the sender is
//! dropped exactly once either way. The mutated subtree travels back to
//! the driver through the task's join handle.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, EngineError};
use crate::model::{CheckScope, Checks, Status};
use crate::plugins::PluginRegistry;
use crate::storage::ChecksWriter;

use super::action::run_action;

/// Run every action of a check set concurrently and wait for all of them.
///
/// A single pre-pass marks every action Running and flushes the node once,
/// so observers see coordinated start times. Returns the first error
/// observed (fatal errors take precedence). The node's own state is driven
/// Running → Completed/Failed, except a continuous set, whose terminal
/// status belongs to its supervisor.
pub(crate) async fn run_checks(
    checks: &mut Checks,
    scope: CheckScope,
    writer: Arc<dyn ChecksWriter>,
    registry: &PluginRegistry,
    cancel: &CancellationToken,
) -> Result<(), ActionError> {
    let now = Utc::now();
    checks.state.status = Status::Running;
    checks.state.start.get_or_insert(now);
    for action in &mut checks.actions {
        action.state.status = Status::Running;
        action.state.start = Some(now);
    }
    writer
        .write(checks, scope)
        .await
        .map_err(EngineError::from)?;

    let action_writer = writer.action(scope);
    let results = join_all(
        checks
            .actions
            .iter_mut()
            .map(|action| run_action(action, &*action_writer, registry, cancel)),
    )
    .await;

    let mut first_err: Option<ActionError> = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }

    match first_err {
        Some(err) => {
            checks.state.status = Status::Failed;
            checks.state.end = Some(Utc::now());
            writer
                .write(checks, scope)
                .await
                .map_err(EngineError::from)?;
            Err(err)
        }
        None => {
            if scope != CheckScope::Cont {
                checks.state.status = Status::Completed;
                checks.state.end = Some(Utc::now());
            }
            writer
                .write(checks, scope)
                .await
                .map_err(EngineError::from)?;
            Ok(())
        }
    }
}

/// Run a scope's pre-checks and the first pass of its continuous checks in
/// parallel. Returns the scope of the first failing set, with pre-checks
/// taking precedence when both fail.
pub(crate) async fn run_pre_phase(
    pre: &mut Option<Checks>,
    cont: &mut Option<Checks>,
    writer: Arc<dyn ChecksWriter>,
    registry: &PluginRegistry,
    cancel: &CancellationToken,
) -> Result<Option<CheckScope>, EngineError> {
    let pre_fut = async {
        match pre.as_mut() {
            Some(checks) => {
                run_checks(checks, CheckScope::Pre, writer.clone(), registry, cancel).await
            }
            None => Ok(()),
        }
    };
    let cont_fut = async {
        match cont.as_mut() {
            Some(checks) => {
                run_checks(checks, CheckScope::Cont, writer.clone(), registry, cancel).await
            }
            None => Ok(()),
        }
    };
    let (pre_result, cont_result) = tokio::join!(pre_fut, cont_fut);

    if let Err(err) = pre_result {
        return match err.into_fatal() {
            Ok(fatal) => Err(fatal),
            Err(check_err) => {
                tracing::debug!("pre-checks failed: {check_err}");
                Ok(Some(CheckScope::Pre))
            }
        };
    }
    if let Err(err) = cont_result {
        return match err.into_fatal() {
            Ok(fatal) => Err(fatal),
            Err(check_err) => {
                tracing::debug!("continuous checks failed on first pass: {check_err}");
                Ok(Some(CheckScope::Cont))
            }
        };
    }
    Ok(None)
}

/// Handle to a running continuous-check supervisor.
pub(crate) struct ContCheckTask {
    cancel: CancellationToken,
    result_rx: mpsc::Receiver<ActionError>,
    join: JoinHandle<Checks>,
}

impl ContCheckTask {
    /// Non-blocking poll for a trip. Consumes the terminal value if one has
    /// been published; the caller is responsible for acting on it.
    pub(crate) fn poll_trip(&mut self) -> Option<ActionError> {
        match self.result_rx.try_recv() {
            Ok(err) => Some(err),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => None,
        }
    }

    /// Cancel the supervisor, consume its terminal result (if any remains)
    /// and reclaim the Checks subtree it owned.
    pub(crate) async fn shutdown(mut self) -> Result<(Checks, Option<ActionError>), EngineError> {
        self.cancel.cancel();
        let result = self.result_rx.recv().await;
        let checks = self.join.await.map_err(|e| {
            EngineError::InternalFailure(format!("continuous-check supervisor panicked: {e}"))
        })?;
        match result {
            Some(err) => match err.into_fatal() {
                Ok(fatal) => Err(fatal),
                Err(check_err) => Ok((checks, Some(check_err))),
            },
            None => Ok((checks, None)),
        }
    }
}

/// Spawn the continuous-check supervisor for one scope.
///
/// The supervisor owns its cancellation token — detached from the outer
/// execution context so the state machine controls its shutdown
/// explicitly — and runs each tick under the set's timeout on a context of
/// its own, so a tick always finishes or times out even during shutdown.
pub(crate) fn spawn_cont_checks(
    mut checks: Checks,
    writer: Arc<dyn ChecksWriter>,
    registry: Arc<PluginRegistry>,
) -> ContCheckTask {
    let cancel = CancellationToken::new();
    let (tx, result_rx) = mpsc::channel(1);
    let token = cancel.clone();

    let join = tokio::spawn(async move {
        let delay = checks.effective_delay();
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if !checks.state.status.is_terminal() {
                        checks.state.status = Status::Completed;
                        checks.state.end = Some(Utc::now());
                    }
                    if let Err(e) = writer.write(&checks, CheckScope::Cont).await {
                        let _ = tx.send(ActionError::Fatal(e.into())).await;
                    }
                    return checks;
                }
                _ = tokio::time::sleep(delay) => {
                    for action in &mut checks.actions {
                        action.reset();
                    }
                    if let Err(e) = writer.write(&checks, CheckScope::Cont).await {
                        let _ = tx.send(ActionError::Fatal(e.into())).await;
                        return checks;
                    }

                    let tick_timeout = checks.timeout;
                    let tick = tokio::time::timeout(
                        tick_timeout,
                        run_checks(
                            &mut checks,
                            CheckScope::Cont,
                            writer.clone(),
                            &registry,
                            &CancellationToken::new(),
                        ),
                    )
                    .await;

                    match tick {
                        Err(_) => {
                            checks.state.status = Status::Failed;
                            checks.state.end = Some(Utc::now());
                            let flush = writer.write(&checks, CheckScope::Cont).await;
                            let err = match flush {
                                Err(e) => ActionError::Fatal(e.into()),
                                Ok(()) => ActionError::Timeout(tick_timeout),
                            };
                            tracing::warn!("continuous checks timed out after {tick_timeout:?}");
                            let _ = tx.send(err).await;
                            return checks;
                        }
                        Ok(Err(err)) => {
                            // run_checks already marked and flushed the
                            // node as Failed for non-fatal errors.
                            tracing::warn!("continuous checks tripped: {err}");
                            let _ = tx.send(err).await;
                            return checks;
                        }
                        Ok(Ok(())) => {}
                    }
                }
            }
        }
    });

    ContCheckTask {
        cancel,
        result_rx,
        join,
    }
}

/// Terminalize a continuous set whose supervisor never started (the scope
/// short-circuited during its pre-phase). A set still Running from a
/// successful first pass becomes Completed.
pub(crate) async fn settle_unsupervised(
    checks: &mut Checks,
    writer: &Arc<dyn ChecksWriter>,
) -> Result<(), EngineError> {
    if checks.state.status == Status::Running {
        checks.state.status = Status::Completed;
        checks.state.end = Some(Utc::now());
        writer.write(checks, CheckScope::Cont).await?;
    }
    Ok(())
}
