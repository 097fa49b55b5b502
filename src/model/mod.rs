//! The plan tree: the data model executed by the engine.
//!
//! A [`Plan`] owns ordered [`Block`]s; a block owns ordered [`Sequence`]s;
//! a sequence owns ordered [`Action`]s. Plans and blocks additionally carry
//! optional pre/continuous/post [`Checks`] sets. Every entity embeds a
//! [`State`] that the engine advances monotonically to a terminal status,
//! flushing each transition through the storage writers.
//!
//! The tree is plain owned data. Runtime artifacts (cancellation tokens,
//! supervisor channels) never live here; the engine keeps them in parallel
//! handle structures for the duration of a run.

mod status;
mod validate;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use status::{CheckScope, FailureReason, Status};
pub use validate::{validate_plan, Object, ValidationError};

/// Default timeout applied to actions and check sets that leave it unset.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Minimum permitted action timeout.
pub const MIN_ACTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Default delay between continuous-check runs.
pub const DEFAULT_CONT_DELAY: Duration = Duration::from_secs(30);

/// Execution state embedded in every entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    pub status: Status,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl State {
    /// Return the entity to its unstarted state. Used by the continuous
    /// check supervisor before each tick.
    pub fn reset(&mut self) {
        self.status = Status::NotStarted;
        self.start = None;
        self.end = None;
    }
}

/// The top-level container of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub name: String,
    pub descr: String,
    /// Groups related plans for informational purposes only.
    pub group_id: Option<Uuid>,
    /// Opaque caller metadata; never interpreted by the engine.
    pub meta: Option<Value>,

    pub pre_checks: Option<Checks>,
    pub cont_checks: Option<Checks>,
    pub post_checks: Option<Checks>,

    /// Blocks execute strictly in order, one at a time.
    pub blocks: Vec<Block>,

    pub submit_time: Option<DateTime<Utc>>,
    /// Non-`Unknown` iff the plan failed.
    pub reason: FailureReason,
    pub state: State,
}

impl Plan {
    pub fn new(name: impl Into<String>, descr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            descr: descr.into(),
            group_id: None,
            meta: None,
            pre_checks: None,
            cont_checks: None,
            post_checks: None,
            blocks: Vec::new(),
            submit_time: None,
            reason: FailureReason::Unknown,
            state: State::default(),
        }
    }
}

/// An unordered set of check actions run for validation rather than
/// primary work. The same shape backs pre, continuous and post checks;
/// `delay` only matters for a continuous set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checks {
    pub id: Uuid,
    /// Actions run concurrently; any failure fails the set.
    pub actions: Vec<Action>,
    /// Bound on one full run of the set.
    pub timeout: Duration,
    /// Wait between continuous-check runs. `None` defaults to
    /// [`DEFAULT_CONT_DELAY`]; `Some(Duration::ZERO)` means no delay.
    pub delay: Option<Duration>,
    pub state: State,
}

impl Checks {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actions,
            timeout: DEFAULT_TIMEOUT,
            delay: None,
            state: State::default(),
        }
    }

    /// Effective delay between continuous runs.
    pub fn effective_delay(&self) -> Duration {
        self.delay.unwrap_or(DEFAULT_CONT_DELAY)
    }
}

/// An ordered unit of work within a plan. Sequences inside a block run with
/// up to `concurrency` in flight; the block tolerates `tolerated_failures`
/// failed sequences before failing itself (-1 tolerates any number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: Uuid,
    pub name: String,
    pub descr: String,

    /// Wait before the block starts.
    pub entrance_delay: Duration,
    /// Wait after the block completes.
    pub exit_delay: Duration,

    pub pre_checks: Option<Checks>,
    pub cont_checks: Option<Checks>,
    pub post_checks: Option<Checks>,

    pub sequences: Vec<Sequence>,

    /// Sequences allowed in flight at once. Defaults to 1.
    pub concurrency: usize,
    /// Failed sequences permitted before the block fails. -1 = unlimited.
    pub tolerated_failures: i32,

    pub state: State,
}

impl Block {
    pub fn new(name: impl Into<String>, descr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            descr: descr.into(),
            entrance_delay: Duration::ZERO,
            exit_delay: Duration::ZERO,
            pre_checks: None,
            cont_checks: None,
            post_checks: None,
            sequences: Vec::new(),
            concurrency: 1,
            tolerated_failures: 0,
            state: State::default(),
        }
    }
}

/// An ordered list of actions; the first action failure fails the sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub descr: String,
    pub actions: Vec<Action>,
    pub state: State,
}

impl Sequence {
    pub fn new(name: impl Into<String>, descr: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            descr: descr.into(),
            actions: Vec::new(),
            state: State::default(),
        }
    }
}

/// One recorded plugin call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attempt {
    /// The plugin's response, when it returned one of the expected shape.
    pub resp: Option<Value>,
    /// The failure message, when the attempt failed.
    pub err: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// A single plugin invocation with retry and timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub descr: String,
    /// Registry name of the plugin to invoke.
    pub plugin: String,
    /// Bound on each attempt. Defaults to 30s, must be at least 5s.
    pub timeout: Duration,
    /// Retries after the first attempt; at most `retries + 1` attempts run.
    pub retries: u32,
    /// Opaque request handed to the plugin.
    pub req: Value,

    /// Attempts recorded so far, oldest first.
    pub attempts: Vec<Attempt>,
    pub state: State,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        descr: impl Into<String>,
        plugin: impl Into<String>,
        req: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            descr: descr.into(),
            plugin: plugin.into(),
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
            req,
            attempts: Vec::new(),
            state: State::default(),
        }
    }

    /// Return the action to its unstarted state, clearing recorded
    /// attempts. Used by the continuous check supervisor between ticks.
    pub fn reset(&mut self) {
        self.state.reset();
        self.attempts.clear();
    }
}

/// Fill unset fields across the tree: zero timeouts become the default,
/// zero concurrency becomes 1. Run before validation.
pub(crate) fn apply_defaults(plan: &mut Plan) {
    for checks in [
        plan.pre_checks.as_mut(),
        plan.cont_checks.as_mut(),
        plan.post_checks.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        default_checks(checks);
    }
    for block in &mut plan.blocks {
        if block.concurrency < 1 {
            block.concurrency = 1;
        }
        for checks in [
            block.pre_checks.as_mut(),
            block.cont_checks.as_mut(),
            block.post_checks.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            default_checks(checks);
        }
        for seq in &mut block.sequences {
            for action in &mut seq.actions {
                default_action(action);
            }
        }
    }
}

fn default_checks(checks: &mut Checks) {
    if checks.timeout.is_zero() {
        checks.timeout = DEFAULT_TIMEOUT;
    }
    for action in &mut checks.actions {
        default_action(action);
    }
}

fn default_action(action: &mut Action) {
    if action.timeout.is_zero() {
        action.timeout = DEFAULT_TIMEOUT;
    }
}
