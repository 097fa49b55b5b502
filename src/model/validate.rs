//! Plan validation and the generic tree walker.
//!
//! Validation runs over [`walk`], a queue-driven traversal yielding tagged
//! [`Object`] variants, so structural rules live in one place instead of
//! being scattered across entity impls.

use std::collections::VecDeque;

use thiserror::Error;

use crate::model::{
    Action, Block, CheckScope, Checks, FailureReason, Plan, Sequence, Status, MIN_ACTION_TIMEOUT,
};
use crate::plugins::PluginRegistry;

/// A plan failed validation and cannot be executed.
#[derive(Debug, Clone, Error)]
#[error("{context}: {message}")]
pub struct ValidationError {
    /// The entity the rule was violated on, e.g. `action "drain-node"`.
    pub context: String,
    pub message: String,
}

impl ValidationError {
    fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// A tagged reference to one entity of the plan tree, yielded by [`walk`].
#[derive(Debug, Clone, Copy)]
pub enum Object<'a> {
    Plan(&'a Plan),
    Checks {
        scope: CheckScope,
        checks: &'a Checks,
    },
    Block(&'a Block),
    Sequence(&'a Sequence),
    Action {
        action: &'a Action,
        /// `Some` when the action belongs to a check set rather than a
        /// sequence.
        check_scope: Option<CheckScope>,
    },
}

/// Walk the tree breadth-first, parents before children.
pub fn walk(plan: &Plan) -> impl Iterator<Item = Object<'_>> {
    let mut out = Vec::new();
    let mut queue: VecDeque<Object<'_>> = VecDeque::new();
    queue.push_back(Object::Plan(plan));

    while let Some(obj) = queue.pop_front() {
        match obj {
            Object::Plan(p) => {
                push_checks(&mut queue, p.pre_checks.as_ref(), p.cont_checks.as_ref(), p.post_checks.as_ref());
                queue.extend(p.blocks.iter().map(Object::Block));
            }
            Object::Checks { scope, checks } => {
                queue.extend(checks.actions.iter().map(|a| Object::Action {
                    action: a,
                    check_scope: Some(scope),
                }));
            }
            Object::Block(b) => {
                push_checks(&mut queue, b.pre_checks.as_ref(), b.cont_checks.as_ref(), b.post_checks.as_ref());
                queue.extend(b.sequences.iter().map(Object::Sequence));
            }
            Object::Sequence(s) => {
                queue.extend(s.actions.iter().map(|a| Object::Action {
                    action: a,
                    check_scope: None,
                }));
            }
            Object::Action { .. } => {}
        }
        out.push(obj);
    }
    out.into_iter()
}

fn push_checks<'a>(
    queue: &mut VecDeque<Object<'a>>,
    pre: Option<&'a Checks>,
    cont: Option<&'a Checks>,
    post: Option<&'a Checks>,
) {
    for (scope, checks) in [
        (CheckScope::Pre, pre),
        (CheckScope::Cont, cont),
        (CheckScope::Post, post),
    ] {
        if let Some(checks) = checks {
            queue.push_back(Object::Checks { scope, checks });
        }
    }
}

/// Validate a plan against the structural rules and the plugin registry.
/// Callers run this (via [`Executor::run`](crate::core::Executor::run))
/// before execution; the engine treats an unresolvable plugin after this
/// point as an internal bug.
pub fn validate_plan(plan: &Plan, registry: &PluginRegistry) -> Result<(), ValidationError> {
    for obj in walk(plan) {
        match obj {
            Object::Plan(p) => validate_top(p)?,
            Object::Checks { scope, checks } => validate_checks(scope, checks)?,
            Object::Block(b) => validate_block(b)?,
            Object::Sequence(s) => validate_sequence(s)?,
            Object::Action {
                action,
                check_scope,
            } => validate_action(action, check_scope, registry)?,
        }
    }
    Ok(())
}

fn validate_top(plan: &Plan) -> Result<(), ValidationError> {
    let ctx = format!("plan {:?}", plan.name);
    require_named(&ctx, &plan.name, &plan.descr)?;
    if plan.blocks.is_empty() {
        return Err(ValidationError::new(ctx, "at least one block is required"));
    }
    if plan.state.status != Status::NotStarted {
        return Err(ValidationError::new(ctx, "state must not be set by the caller"));
    }
    if plan.reason != FailureReason::Unknown || plan.submit_time.is_some() {
        return Err(ValidationError::new(
            ctx,
            "internal settings must not be set by the caller",
        ));
    }
    Ok(())
}

fn validate_checks(scope: CheckScope, checks: &Checks) -> Result<(), ValidationError> {
    let ctx = format!("{scope} set");
    if checks.actions.is_empty() {
        return Err(ValidationError::new(ctx, "at least one action is required"));
    }
    if checks.state.status != Status::NotStarted {
        return Err(ValidationError::new(ctx, "state must not be set by the caller"));
    }
    Ok(())
}

fn validate_block(block: &Block) -> Result<(), ValidationError> {
    let ctx = format!("block {:?}", block.name);
    require_named(&ctx, &block.name, &block.descr)?;
    if block.concurrency < 1 {
        return Err(ValidationError::new(ctx, "concurrency must be at least 1"));
    }
    if block.tolerated_failures < -1 {
        return Err(ValidationError::new(
            ctx,
            "tolerated_failures must be -1 (unlimited) or non-negative",
        ));
    }
    if block.sequences.is_empty() {
        return Err(ValidationError::new(ctx, "at least one sequence is required"));
    }
    if block.state.status != Status::NotStarted {
        return Err(ValidationError::new(ctx, "state must not be set by the caller"));
    }
    Ok(())
}

fn validate_sequence(seq: &Sequence) -> Result<(), ValidationError> {
    let ctx = format!("sequence {:?}", seq.name);
    require_named(&ctx, &seq.name, &seq.descr)?;
    if seq.actions.is_empty() {
        return Err(ValidationError::new(ctx, "at least one action is required"));
    }
    if seq.state.status != Status::NotStarted {
        return Err(ValidationError::new(ctx, "state must not be set by the caller"));
    }
    Ok(())
}

fn validate_action(
    action: &Action,
    check_scope: Option<CheckScope>,
    registry: &PluginRegistry,
) -> Result<(), ValidationError> {
    let ctx = format!("action {:?}", action.name);
    require_named(&ctx, &action.name, &action.descr)?;
    if action.plugin.trim().is_empty() {
        return Err(ValidationError::new(ctx, "plugin is required"));
    }
    if action.timeout < MIN_ACTION_TIMEOUT {
        return Err(ValidationError::new(
            ctx,
            format!("timeout must be at least {MIN_ACTION_TIMEOUT:?}"),
        ));
    }
    if !action.attempts.is_empty() || action.state.status != Status::NotStarted {
        return Err(ValidationError::new(
            ctx,
            "attempts and state must not be set by the caller",
        ));
    }

    let plugin = registry.plugin(&action.plugin).ok_or_else(|| {
        ValidationError::new(&ctx, format!("plugin {:?} is not registered", action.plugin))
    })?;
    match check_scope {
        Some(scope) if !plugin.is_check() => {
            return Err(ValidationError::new(
                ctx,
                format!(
                    "plugin {:?} is not a check plugin and cannot be used in a {scope} set",
                    action.plugin
                ),
            ));
        }
        None if plugin.is_check() => {
            return Err(ValidationError::new(
                ctx,
                format!(
                    "plugin {:?} is a check plugin and cannot be used in a sequence",
                    action.plugin
                ),
            ));
        }
        _ => {}
    }
    plugin
        .validate_request(&action.req)
        .map_err(|e| ValidationError::new(&ctx, format!("plugin {:?}: {e}", action.plugin)))?;
    Ok(())
}

fn require_named(ctx: &str, name: &str, descr: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new(ctx, "name is required"));
    }
    if descr.trim().is_empty() {
        return Err(ValidationError::new(ctx, "description is required"));
    }
    Ok(())
}
