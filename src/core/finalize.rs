//! The finalizer: terminal status and failure-reason attribution.

use chrono::Utc;

use crate::error::EngineError;
use crate::model::{CheckScope, FailureReason, Plan, Status};

/// Set the plan's terminal status and failure reason from the completed
/// tree.
///
/// `detected` is the first failure reason the runtime observed; it takes
/// precedence over re-examination of the tree, so a plan-level continuous
/// check that tripped mid-block attributes `ContCheck` even though the
/// interrupted block is also failed. Check sets are examined in
/// pre/cont/post order, then blocks. An entity that never started is
/// skipped — execution short-circuited before reaching it — but one caught
/// mid-run is an invariant violation: the plan is still marked failed and
/// the violation surfaces as an error.
pub(crate) fn finalize(plan: &mut Plan, detected: Option<FailureReason>) -> Result<(), EngineError> {
    let mut reason = detected;
    let mut violation: Option<String> = None;

    let scoped = [
        (CheckScope::Pre, plan.pre_checks.as_ref()),
        (CheckScope::Cont, plan.cont_checks.as_ref()),
        (CheckScope::Post, plan.post_checks.as_ref()),
    ];
    for (scope, checks) in scoped {
        let Some(checks) = checks else { continue };
        match checks.state.status {
            Status::Completed | Status::NotStarted => {}
            Status::Failed => {
                reason.get_or_insert(scope.failure_reason());
            }
            other => {
                reason.get_or_insert(scope.failure_reason());
                violation.get_or_insert(format!(
                    "plan {scope} set ended in {other} state, which is invalid"
                ));
            }
        }
    }

    for block in &plan.blocks {
        match block.state.status {
            Status::Completed | Status::NotStarted => {}
            Status::Failed => {
                reason.get_or_insert(FailureReason::Block);
            }
            other => {
                reason.get_or_insert(FailureReason::Block);
                violation.get_or_insert(format!(
                    "block {:?} ended in {other} state, which is invalid",
                    block.name
                ));
            }
        }
    }

    match reason {
        Some(reason) => {
            plan.state.status = Status::Failed;
            plan.reason = reason;
        }
        None => {
            plan.state.status = Status::Completed;
            plan.reason = FailureReason::Unknown;
        }
    }
    plan.state.end = Some(Utc::now());

    match violation {
        Some(message) => {
            tracing::warn!("{message}");
            Err(EngineError::InternalFailure(message))
        }
        None => Ok(()),
    }
}
