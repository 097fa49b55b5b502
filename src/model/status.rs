//! Status and failure-reason enumerations shared by every plan entity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Execution status of a plan entity. Not every entity uses every status:
/// only a plan is ever `Started`, and `Stopped` exists for external tooling
/// (the engine itself never stops a plan mid-flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Execution has not begun.
    #[default]
    NotStarted,
    /// Submitted by the user but not yet executing. Plans only.
    Started,
    /// Currently executing.
    Running,
    /// Finished successfully. For a plan this means the execution ran to
    /// its end, not that every sequence succeeded.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Halted by a user action. Unused by the engine.
    Stopped,
}

impl Status {
    /// Numeric code, spaced for forward compatibility in stored rows.
    pub fn code(self) -> u16 {
        match self {
            Status::NotStarted => 0,
            Status::Started => 100,
            Status::Running => 200,
            Status::Completed => 300,
            Status::Failed => 400,
            Status::Stopped => 500,
        }
    }

    /// Whether the status is final; a terminal status is written once and
    /// never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::NotStarted => "NotStarted",
            Status::Started => "Started",
            Status::Running => "Running",
            Status::Completed => "Completed",
            Status::Failed => "Failed",
            Status::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Categorical cause attributed to a failed plan. `Unknown` on any plan
/// that is not failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    #[default]
    Unknown,
    PreCheck,
    Block,
    PostCheck,
    ContCheck,
    Stopped,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Unknown => "Unknown",
            FailureReason::PreCheck => "PreCheck",
            FailureReason::Block => "Block",
            FailureReason::PostCheck => "PostCheck",
            FailureReason::ContCheck => "ContCheck",
            FailureReason::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Which check set a Checks node (and its actions' storage writes) belongs
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckScope {
    Pre,
    Cont,
    Post,
}

impl CheckScope {
    /// The failure reason a failed check set at this scope attributes to
    /// the plan.
    pub fn failure_reason(self) -> FailureReason {
        match self {
            CheckScope::Pre => FailureReason::PreCheck,
            CheckScope::Cont => FailureReason::ContCheck,
            CheckScope::Post => FailureReason::PostCheck,
        }
    }
}

impl fmt::Display for CheckScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckScope::Pre => "pre-check",
            CheckScope::Cont => "continuous-check",
            CheckScope::Post => "post-check",
        };
        f.write_str(s)
    }
}
