//! The plugin capability surface and registry.
//!
//! Every action names a [`Plugin`]; the engine resolves it from the
//! [`PluginRegistry`] at execution time and drives it with the plugin's own
//! [`RetryPolicy`]. The registry is built once before execution and treated
//! as immutable for the lifetime of a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// An error produced by a plugin. `permanent` failures are never retried;
/// everything else retries on the plugin's policy until the action's
/// retry budget runs out.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PluginError {
    pub message: String,
    pub permanent: bool,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: true,
        }
    }
}

/// The capability set every plugin implements.
///
/// Request and response payloads are opaque JSON. `response_prototype`
/// declares the shape the engine holds `execute` to: a response of a
/// different JSON kind is recorded as a permanent attempt failure so a
/// misbehaving plugin cannot propagate an unexpected value downstream.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry name, referenced by [`Action::plugin`](crate::model::Action).
    fn name(&self) -> &str;

    /// Execute one attempt. The engine bounds each call with the action's
    /// timeout; implementations do not need their own deadline handling.
    async fn execute(&self, req: &Value) -> Result<Value, PluginError>;

    /// Validate a request during plan validation, before execution begins.
    fn validate_request(&self, req: &Value) -> Result<(), PluginError>;

    /// An empty request of the expected shape.
    fn request_prototype(&self) -> Value;

    /// An empty response of the expected shape.
    fn response_prototype(&self) -> Value;

    /// Check plugins may only be used in pre/continuous/post check sets;
    /// non-check plugins only in sequences.
    fn is_check(&self) -> bool;

    /// How the engine spaces retries of this plugin.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fast()
    }

    /// Readiness probe run at registration, e.g. checking that a required
    /// command-line tool is installed.
    fn init(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Process-wide plugin registry. Register everything up front, then share
/// it immutably (`Arc<PluginRegistry>`) with the executor.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, running its readiness probe. Duplicate names are
    /// rejected.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().to_string();
        if name.trim().is_empty() {
            return Err(PluginError::new("plugin name is required"));
        }
        if self.plugins.contains_key(&name) {
            return Err(PluginError::new(format!(
                "plugin {name:?} is already registered"
            )));
        }
        plugin.init()?;
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Resolve a plugin by name.
    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Exponential backoff schedule for retrying a plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Interval before the first retry.
    pub initial_interval: Duration,
    /// Factor applied to the interval after each retry.
    pub multiplier: f64,
    /// Jitter as a fraction of the interval, 0.0..=0.5. Each computed
    /// interval is drawn uniformly from `interval * (1 ± factor)`.
    pub randomization_factor: f64,
    /// Upper bound on any single interval.
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Fast at first, then slows: 100ms, 200ms, 400ms, ... capped at 60s,
    /// jittered up to ±50%.
    pub fn fast() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
        }
    }

    /// Second-scale progression: 1s, 2s, 4s, ... capped at 60s.
    pub fn seconds() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
        }
    }

    /// Slow progression for heavyweight operations: 30s, 33s, 36s, ...
    /// capped at 5 minutes, jittered up to ±20%.
    pub fn thirty_seconds() -> Self {
        Self {
            initial_interval: Duration::from_secs(30),
            multiplier: 1.1,
            randomization_factor: 0.2,
            max_interval: Duration::from_secs(300),
        }
    }

    /// The jittered interval to sleep before retry number `retry`
    /// (0-based).
    pub fn interval_for(&self, retry: u32) -> Duration {
        let base = self.initial_interval.as_secs_f64() * self.multiplier.powi(retry as i32);
        let base = base.min(self.max_interval.as_secs_f64());
        let factor = self.randomization_factor.clamp(0.0, 0.5);
        let jitter = if factor > 0.0 {
            // Uniform in [-factor, +factor].
            (rand::random::<f64>() * 2.0 - 1.0) * factor
        } else {
            0.0
        };
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fast()
    }
}
