//! Sequence execution: actions strictly in order, fail-fast.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{ActionError, EngineError};
use crate::model::{Sequence, Status};
use crate::plugins::PluginRegistry;
use crate::storage::SequenceWriter;

use super::action::run_action;

/// Run a sequence's actions in declaration order. The first action failure
/// fails the sequence; remaining actions never start. The sequence is
/// flushed on every path out.
pub(crate) async fn exec_sequence(
    seq: &mut Sequence,
    writer: Arc<dyn SequenceWriter>,
    registry: &PluginRegistry,
    cancel: &CancellationToken,
) -> Result<(), ActionError> {
    seq.state.status = Status::Running;
    seq.state.start = Some(Utc::now());
    writer.write(seq).await.map_err(EngineError::from)?;

    let action_writer = writer.action();
    for action in &mut seq.actions {
        if let Err(err) = run_action(action, &*action_writer, registry, cancel).await {
            seq.state.status = Status::Failed;
            seq.state.end = Some(Utc::now());
            writer.write(seq).await.map_err(EngineError::from)?;
            return Err(err);
        }
    }

    seq.state.status = Status::Completed;
    seq.state.end = Some(Utc::now());
    writer.write(seq).await.map_err(EngineError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::model::Action;
    use crate::plugins::{Plugin, PluginError, RetryPolicy};
    use crate::storage::{MemoryStore, PlanStore};
    use uuid::Uuid;

    struct Recorder {
        order: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        async fn execute(&self, req: &Value) -> Result<Value, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let tag = req["tag"].as_str().unwrap_or_default().to_string();
            self.order.lock().push(tag);
            if req["fail"].as_bool().unwrap_or(false) {
                Err(PluginError::new("scripted failure"))
            } else {
                Ok(json!({}))
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
            false
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

    fn harness() -> (
        Arc<PluginRegistry>,
        MemoryStore,
        Arc<Mutex<Vec<String>>>,
        Arc<AtomicUsize>,
    ) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry
            .register(Arc::new(Recorder {
                order: order.clone(),
                calls: calls.clone(),
            }))
            .unwrap();
        (Arc::new(registry), MemoryStore::new(), order, calls)
    }

    fn action(tag: &str, fail: bool) -> Action {
        let mut a = Action::new(tag, "step", "recorder", json!({"tag": tag, "fail": fail}));
        a.timeout = Duration::from_secs(5);
        a
    }

    #[tokio::test]
    async fn test_actions_run_in_order() {
        let (registry, store, order, _calls) = harness();
        let mut seq = Sequence::new("s", "d");
        seq.actions = vec![action("a", false), action("b", false), action("c", false)];
        let writer = store.block(Uuid::new_v4()).sequence(seq.id);

        exec_sequence(&mut seq, writer, &registry, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(seq.state.status, Status::Completed);
        assert_eq!(store.status_history(seq.id).last(), Some(&Status::Completed));
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_sequence() {
        let (registry, store, order, calls) = harness();
        let mut seq = Sequence::new("s", "d");
        seq.actions = vec![action("a", false), action("b", true), action("c", false)];
        let writer = store.block(Uuid::new_v4()).sequence(seq.id);

        let err = exec_sequence(&mut seq, writer, &registry, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::Plugin { .. }));
        assert_eq!(*order.lock(), vec!["a", "b"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(seq.state.status, Status::Failed);
        assert_eq!(seq.actions[0].state.status, Status::Completed);
        assert_eq!(seq.actions[1].state.status, Status::Failed);
        assert_eq!(seq.actions[2].state.status, Status::NotStarted);
    }
}
