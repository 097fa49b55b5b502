//! The plugin invoker: drives a single action to a terminal status.

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, EngineError};
use crate::model::{Action, Attempt, Status};
use crate::plugins::PluginRegistry;
use crate::storage::ActionWriter;

/// Run one action to completion or failure.
///
/// Each attempt runs under the action's timeout, detached from the outer
/// cancellation so one attempt always finishes or times out; the outer
/// token is consulted between attempts and during backoff sleeps. The
/// action is flushed after every attempt so observers see each retry as it
/// lands.
pub(crate) async fn run_action(
    action: &mut Action,
    writer: &dyn ActionWriter,
    registry: &PluginRegistry,
    cancel: &CancellationToken,
) -> Result<(), ActionError> {
    action.state.status = Status::Running;
    action.state.start = Some(Utc::now());
    writer.write(action).await.map_err(EngineError::from)?;

    // The validator resolved this name before execution began; a miss here
    // is a bug, not a plan failure.
    let plugin = registry.plugin(&action.plugin).ok_or_else(|| {
        ActionError::Fatal(EngineError::PluginNotFound(action.plugin.clone()))
    })?;
    let policy = plugin.retry_policy();
    let want = value_kind(&plugin.response_prototype());

    let mut last_err: Option<ActionError> = None;
    let result = loop {
        if action.attempts.len() > action.retries as usize {
            // Retry budget exhausted; the last attempt's error stands.
            break Err(last_err.take().unwrap_or(ActionError::Plugin {
                plugin: action.plugin.clone(),
                message: "retry budget exhausted before any attempt".into(),
            }));
        }
        if cancel.is_cancelled() {
            break Err(ActionError::Canceled);
        }

        let mut attempt = Attempt {
            start: Some(Utc::now()),
            ..Attempt::default()
        };
        let outcome = tokio::time::timeout(action.timeout, plugin.execute(&action.req)).await;
        attempt.end = Some(Utc::now());

        let mut permanent = false;
        let attempt_err = match outcome {
            Err(_) => Some(ActionError::Timeout(action.timeout)),
            Ok(Err(e)) => {
                permanent = e.permanent;
                Some(ActionError::Plugin {
                    plugin: action.plugin.clone(),
                    message: e.message,
                })
            }
            Ok(Ok(resp)) => {
                let got = value_kind(&resp);
                if got != want {
                    // The plugin is misbehaving; do not record or return
                    // the junk value, and do not retry.
                    permanent = true;
                    Some(ActionError::ResponseType {
                        plugin: action.plugin.clone(),
                        got,
                        want,
                    })
                } else {
                    attempt.resp = Some(resp);
                    None
                }
            }
        };
        attempt.err = attempt_err.as_ref().map(ToString::to_string);
        action.attempts.push(attempt);
        writer.write(action).await.map_err(EngineError::from)?;

        match attempt_err {
            None => break Ok(()),
            Some(err) if permanent => break Err(err),
            Some(err) => {
                let retry = action.attempts.len() as u32 - 1;
                last_err = Some(err);
                tokio::select! {
                    _ = cancel.cancelled() => break Err(ActionError::Canceled),
                    _ = tokio::time::sleep(policy.interval_for(retry)) => {}
                }
            }
        }
    };

    action.state.end = Some(Utc::now());
    action.state.status = if result.is_ok() {
        Status::Completed
    } else {
        Status::Failed
    };
    writer.write(action).await.map_err(EngineError::from)?;
    result
}

/// The JSON kind of a value, used to hold plugin responses to their
/// declared prototype.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
