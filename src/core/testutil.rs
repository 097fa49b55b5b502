//! Scripted plugin shared by the core execution tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::plugins::{Plugin, PluginError, RetryPolicy};

/// A plugin whose behavior is scripted per request: `{"fail": bool,
/// "sleep_ms": u64}`. Optionally starts failing from the Nth call, which
/// drives continuous-check trip scenarios. Tracks total and concurrent
/// invocations.
pub(crate) struct ScriptedPlugin {
    name: String,
    check: bool,
    fail_from: Option<usize>,
    started: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl ScriptedPlugin {
    pub(crate) fn new(name: impl Into<String>, check: bool) -> Self {
        Self {
            name: name.into(),
            check,
            fail_from: None,
            started: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            max_running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail every call whose 0-based index is `from` or later.
    pub(crate) fn failing_from(mut self, from: usize) -> Self {
        self.fail_from = Some(from);
        self
    }

    pub(crate) fn started_counter(&self) -> Arc<AtomicUsize> {
        self.started.clone()
    }

    pub(crate) fn max_running_counter(&self) -> Arc<AtomicUsize> {
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

        let scripted_fail = req["fail"].as_bool().unwrap_or(false);
        let scheduled_fail = self.fail_from.is_some_and(|from| call >= from);
        if scripted_fail || scheduled_fail {
            Err(PluginError::new(format!("{} failed on call {call}", self.name)))
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
