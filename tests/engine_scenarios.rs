//! End-to-end execution scenarios.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use runbook::{
    Block, Checks, Executor, FailureReason, MemoryStore, Plan, PluginRegistry, Status,
};
use support::{action, plan_with, work_seq, ScriptedPlugin, WrongTypePlugin};

fn executor(plugins: Vec<Box<dyn runbook::Plugin>>) -> (Executor, MemoryStore) {
    let mut registry = PluginRegistry::new();
    for plugin in plugins {
        registry.register(Arc::from(plugin)).unwrap();
    }
    let store = MemoryStore::new();
    (
        Executor::new(Arc::new(store.clone()), Arc::new(registry)),
        store,
    )
}

async fn run(executor: &Executor, plan: Plan) -> Plan {
    executor
        .run(CancellationToken::new(), plan)
        .await
        .expect("run should not fail")
}

#[tokio::test]
async fn test_happy_path() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    let (executor, store) = executor(vec![Box::new(work)]);

    let mut block = Block::new("b", "one block");
    block.sequences.push(work_seq("s", json!({})));
    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(plan.state.status, Status::Completed);
    assert_eq!(plan.reason, FailureReason::Unknown);
    assert_eq!(started.load(Ordering::SeqCst), 1);

    let block = &plan.blocks[0];
    assert_eq!(block.state.status, Status::Completed);
    let seq = &block.sequences[0];
    assert_eq!(seq.state.status, Status::Completed);
    let action = &seq.actions[0];
    assert_eq!(action.state.status, Status::Completed);
    assert_eq!(action.attempts.len(), 1);
    assert!(action.attempts[0].err.is_none());
    assert!(action.attempts[0].resp.is_some());

    // Every transition reached storage, in order.
    assert_eq!(
        store.status_history(plan.id),
        vec![
            Status::NotStarted,
            Status::Started,
            Status::Running,
            Status::Completed
        ]
    );
    assert_eq!(
        store.status_history(block.id),
        vec![Status::Running, Status::Completed]
    );
    assert_eq!(
        store.status_history(seq.id),
        vec![Status::Running, Status::Completed]
    );
}

#[tokio::test]
async fn test_retries_exhaust() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    let (executor, _store) = executor(vec![Box::new(work)]);

    let mut block = Block::new("b", "retrying block");
    let mut seq = work_seq("s", json!({"fail": true}));
    seq.actions[0].retries = 2;
    block.sequences.push(seq);
    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::Block);
    assert_eq!(started.load(Ordering::SeqCst), 3);

    let action = &plan.blocks[0].sequences[0].actions[0];
    assert_eq!(action.state.status, Status::Failed);
    assert_eq!(action.attempts.len(), 3);
    assert!(action.attempts.iter().all(|a| a.err.is_some()));
    assert_eq!(plan.blocks[0].sequences[0].state.status, Status::Failed);
    assert_eq!(plan.blocks[0].state.status, Status::Failed);
}

#[tokio::test]
async fn test_tolerated_failures_exceeded_on_final_sequence() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    let (executor, _store) = executor(vec![Box::new(work)]);

    let mut block = Block::new("b", "tolerant block");
    block.tolerated_failures = 1;
    block.sequences = vec![
        work_seq("s1", json!({"fail": true})),
        work_seq("s2", json!({})),
        work_seq("s3", json!({"fail": true})),
    ];
    let plan = run(&executor, plan_with(vec![block])).await;

    // All three sequences ran; the second failure only lands after the
    // last admission, so the post-drain budget check fails the block.
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(plan.blocks[0].state.status, Status::Failed);
    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::Block);
}

#[tokio::test]
async fn test_unlimited_tolerance() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    let (executor, _store) = executor(vec![Box::new(work)]);

    let mut block = Block::new("b", "unbreakable block");
    block.tolerated_failures = -1;
    block.sequences = vec![
        work_seq("s1", json!({"fail": true})),
        work_seq("s2", json!({"fail": true})),
        work_seq("s3", json!({"fail": true})),
    ];
    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(plan.blocks[0].state.status, Status::Completed);
    assert_eq!(plan.state.status, Status::Completed);
    assert_eq!(plan.reason, FailureReason::Unknown);
    for seq in &plan.blocks[0].sequences {
        assert_eq!(seq.state.status, Status::Failed);
    }
}

#[tokio::test]
async fn test_block_cont_check_trips_during_execution() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    // First pass and tick one pass, tick two fails.
    let probe = ScriptedPlugin::new("probe", true).failing_from(2);
    let (executor, _store) = executor(vec![Box::new(work), Box::new(probe)]);

    let mut block = Block::new("b", "supervised block");
    block.concurrency = 3;
    block.tolerated_failures = -1;
    block.sequences = (0..10)
        .map(|i| work_seq(&format!("s{i}"), json!({"sleep_ms": 100})))
        .collect();
    let mut cont = Checks::new(vec![action("cont", "probe", json!({}))]);
    cont.delay = Some(Duration::from_millis(10));
    block.cont_checks = Some(cont);

    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::ContCheck);
    let block = &plan.blocks[0];
    assert_eq!(block.state.status, Status::Failed);
    assert_eq!(
        block.cont_checks.as_ref().unwrap().state.status,
        Status::Failed
    );

    // Admission halted before the whole block was dispatched; everything
    // already admitted ran to a terminal status.
    assert!(started.load(Ordering::SeqCst) < 10);
    let admitted = block
        .sequences
        .iter()
        .filter(|s| s.state.status != Status::NotStarted)
        .count();
    assert!(admitted < 10);
    for seq in &block.sequences {
        assert!(
            seq.state.status == Status::NotStarted || seq.state.status.is_terminal(),
            "sequence left mid-run: {:?}",
            seq.state.status
        );
    }
}

#[tokio::test]
async fn test_plan_cont_check_trips_during_block() {
    let work = ScriptedPlugin::new("work", false);
    // First pass passes, tick one fails.
    let probe = ScriptedPlugin::new("probe", true).failing_from(1);
    let (executor, _store) = executor(vec![Box::new(work), Box::new(probe)]);

    let mut block = Block::new("b", "slow block");
    block.tolerated_failures = -1;
    block.sequences = (0..5)
        .map(|i| work_seq(&format!("s{i}"), json!({"sleep_ms": 100})))
        .collect();

    let mut plan = plan_with(vec![block]);
    let mut cont = Checks::new(vec![action("plan-cont", "probe", json!({}))]);
    cont.delay = Some(Duration::from_millis(10));
    plan.cont_checks = Some(cont);

    let plan = run(&executor, plan).await;

    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::ContCheck);
    assert_eq!(plan.blocks[0].state.status, Status::Failed);
    assert_eq!(
        plan.cont_checks.as_ref().unwrap().state.status,
        Status::Failed
    );
}

#[tokio::test]
async fn test_wrong_response_type_is_permanent() {
    let (executor, _store) = executor(vec![Box::new(WrongTypePlugin)]);

    let mut block = Block::new("b", "one block");
    let mut seq = runbook::Sequence::new("s", "wrong type sequence");
    seq.actions.push(action("a", "wrong-type", json!({})));
    seq.actions[0].retries = 4;
    block.sequences.push(seq);
    let plan = run(&executor, plan_with(vec![block])).await;

    let act = &plan.blocks[0].sequences[0].actions[0];
    assert_eq!(act.state.status, Status::Failed);
    // Permanent: one attempt despite the retry budget, and the junk
    // response was not recorded.
    assert_eq!(act.attempts.len(), 1);
    assert!(act.attempts[0].resp.is_none());
    let err = act.attempts[0].err.as_deref().unwrap();
    assert!(err.contains("string"), "error should name the actual kind: {err}");
    assert!(err.contains("object"), "error should name the expected kind: {err}");
    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::Block);
}

#[tokio::test]
async fn test_concurrency_bound_is_honored() {
    let work = ScriptedPlugin::new("work", false);
    let max_running = work.max_running_counter();
    let (executor, _store) = executor(vec![Box::new(work)]);

    let mut block = Block::new("b", "wide block");
    block.concurrency = 3;
    block.sequences = (0..10)
        .map(|i| work_seq(&format!("s{i}"), json!({"sleep_ms": 50})))
        .collect();
    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(plan.state.status, Status::Completed);
    assert_eq!(max_running.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_blocks_run_strictly_in_order() {
    let work = ScriptedPlugin::new("work", false);
    let (executor, _store) = executor(vec![Box::new(work)]);

    let mut first = Block::new("b1", "first block");
    first.sequences.push(work_seq("s1", json!({"sleep_ms": 20})));
    let mut second = Block::new("b2", "second block");
    second.sequences.push(work_seq("s2", json!({})));
    let plan = run(&executor, plan_with(vec![first, second])).await;

    assert_eq!(plan.state.status, Status::Completed);
    let b1 = &plan.blocks[0];
    let b2 = &plan.blocks[1];
    assert_eq!(b1.state.status, Status::Completed);
    assert_eq!(b2.state.status, Status::Completed);
    assert!(b1.state.end.unwrap() <= b2.state.start.unwrap());
}

#[tokio::test]
async fn test_plan_post_check_failure() {
    let work = ScriptedPlugin::new("work", false);
    let probe = ScriptedPlugin::new("probe", true).failing_from(0);
    let (executor, _store) = executor(vec![Box::new(work), Box::new(probe)]);

    let mut block = Block::new("b", "one block");
    block.sequences.push(work_seq("s", json!({})));
    let mut plan = plan_with(vec![block]);
    plan.post_checks = Some(Checks::new(vec![action("post", "probe", json!({}))]));

    let plan = run(&executor, plan).await;

    assert_eq!(plan.blocks[0].state.status, Status::Completed);
    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::PostCheck);
    assert_eq!(
        plan.post_checks.as_ref().unwrap().state.status,
        Status::Failed
    );
}

#[tokio::test]
async fn test_block_pre_check_failure_preserves_scope() {
    let work = ScriptedPlugin::new("work", false);
    let started = work.started_counter();
    let probe = ScriptedPlugin::new("probe", true).failing_from(0);
    let (executor, _store) = executor(vec![Box::new(work), Box::new(probe)]);

    let mut block = Block::new("b", "guarded block");
    block.sequences.push(work_seq("s", json!({})));
    block.pre_checks = Some(Checks::new(vec![action("pre", "probe", json!({}))]));
    let plan = run(&executor, plan_with(vec![block])).await;

    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(plan.blocks[0].state.status, Status::Failed);
    assert_eq!(plan.state.status, Status::Failed);
    assert_eq!(plan.reason, FailureReason::PreCheck);
}

#[tokio::test]
async fn test_healthy_cont_checks_end_completed() {
    let work = ScriptedPlugin::new("work", false);
    let probe = ScriptedPlugin::new("probe", true);
    let (executor, _store) = executor(vec![Box::new(work), Box::new(probe)]);

    let mut block = Block::new("b", "supervised block");
    block.sequences.push(work_seq("s", json!({"sleep_ms": 50})));
    let mut cont = Checks::new(vec![action("cont", "probe", json!({}))]);
    cont.delay = Some(Duration::from_millis(10));
    block.cont_checks = Some(cont);

    let mut plan = plan_with(vec![block]);
    let mut plan_cont = Checks::new(vec![action("plan-cont", "probe", json!({}))]);
    plan_cont.delay = Some(Duration::from_millis(10));
    plan.cont_checks = Some(plan_cont);

    let plan = run(&executor, plan).await;

    assert_eq!(plan.state.status, Status::Completed);
    assert_eq!(plan.reason, FailureReason::Unknown);
    assert_eq!(
        plan.cont_checks.as_ref().unwrap().state.status,
        Status::Completed
    );
    assert_eq!(
        plan.blocks[0].cont_checks.as_ref().unwrap().state.status,
        Status::Completed
    );
}
