//! Shared helpers for the end-to-end tests: a scripted plugin and plan
//! builders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use runbook::{Action, Block, Plan, Plugin, PluginError, RetryPolicy, Sequence};

/// A plugin scripted per request: `{"fail": bool, "sleep_ms": u64}`.
/// `failing_from(n)` makes every call with 0-based index >= n fail, which
/// drives continuous-check trips. Tracks total and peak-concurrent calls.
pub struct ScriptedPlugin {
    name: String,
    check: bool,
    fail_from: Option<usize>,
    started: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedPlugin {
    pub fn new(name: impl Into<String>, check: bool) -> Self {
        Self {
            name: name.into(),
            check,
            fail_from: None,
            started: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_from(mut self, from: usize) -> Self {
        self.fail_from = Some(from);
        self
    }

    pub fn started_counter(&self) -> Arc<AtomicUsize> {
        self.started.clone()
    }

    pub fn max_running_counter(&self) -> Arc<AtomicUsize> {
        self.max_running.clone()
    }
}

#[async_trait]
impl Plugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, req: &Value) -> Result<Value, PluginError> {
        let call = self.started.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let sleep_ms = req["sleep_ms"].as_u64().unwrap_or(0);
        if sleep_ms > 0 {
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let fail = req["fail"].as_bool().unwrap_or(false)
            || self.fail_from.is_some_and(|from| call >= from);
        if fail {
            Err(PluginError::new(format!(
                "{} failed on call {call}",
                self.name
            )))
        } else {
            Ok(json!({"call": call}))
        }
    }

    fn validate_request(&self, _req: &Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn request_prototype(&self) -> Value {
        json!({})
    }

    fn response_prototype(&self) -> Value {
        json!({})
    }

    fn is_check(&self) -> bool {
        self.check
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 1.0,
            randomization_factor: 0.0,
            max_interval: Duration::from_millis(5),
        }
    }
}

/// A plugin that declares an object response prototype but returns a
/// string.
pub struct WrongTypePlugin;

#[async_trait]
impl Plugin for WrongTypePlugin {
    fn name(&self) -> &str {
        "wrong-type"
    }

    async fn execute(&self, _req: &Value) -> Result<Value, PluginError> {
        Ok(Value::String("not what was promised".into()))
    }

    fn validate_request(&self, _req: &Value) -> Result<(), PluginError> {
        Ok(())
    }

    fn request_prototype(&self) -> Value {
        json!({})
    }

    fn response_prototype(&self) -> Value {
        json!({})
    }

    fn is_check(&self) -> bool {
        false
    }
}

/// One action invoking `plugin` with the given request.
pub fn action(name: &str, plugin: &str, req: Value) -> Action {
    let mut action = Action::new(name, format!("{name} action"), plugin, req);
    action.timeout = Duration::from_secs(10);
    action
}

/// A single-action sequence for the `work` plugin.
pub fn work_seq(name: &str, req: Value) -> Sequence {
    let mut seq = Sequence::new(name, format!("{name} sequence"));
    seq.actions.push(action(&format!("{name}-a"), "work", req));
    seq
}

/// A plan holding exactly the given blocks.
pub fn plan_with(blocks: Vec<Block>) -> Plan {
    let mut plan = Plan::new("test-plan", "end-to-end test plan");
    plan.blocks = blocks;
    plan
}
