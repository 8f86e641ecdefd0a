mod common;

use common::{engine_with, test_engine, ScriptedStep, TestEngine};
use economyflow::{
    lane::types::{LaneKey, SequenceCheck},
    runtime::{
        dispatch::DispatchMessage,
        reconcile::{ReconcileReport, Reconciler},
        router::AdvanceOutcome,
        step::StepHandlers,
    },
    steps::test_harness::HarnessStep,
    workflow::{
        definitions::{self, test::{S1, S2}},
        registry::{StepTransition, StepsConfig, StepsConfigRegistry},
        types::{StepStatus, WorkflowKind, WorkflowStatus, INIT, MARK_FAILURE, MARK_SUCCESS},
    },
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

const HOUR: Duration = Duration::from_secs(3600);

/// init → x → markSuccess, with x failing over to rollbackX → markFailure
async fn rollback_engine(x: Arc<ScriptedStep>, rollback: Arc<ScriptedStep>) -> TestEngine {
    let config = StepsConfig::builder(WorkflowKind::Test)
        .step(INIT, StepTransition::new().on_success(["x"]))
        .step("x", StepTransition::new().on_success([MARK_SUCCESS]).on_failure("rollbackX"))
        .step("rollbackX", StepTransition::new().on_success([MARK_FAILURE]))
        .compile()
        .unwrap();
    let mut registry = StepsConfigRegistry::new();
    registry.register(config);

    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, "x", x)
        .register(WorkflowKind::Test, "rollbackX", rollback);
    engine_with(registry, handlers).await
}

#[tokio::test]
async fn stale_pending_step_times_out_into_its_failure_edge() {
    let rollback = ScriptedStep::done(json!({"rolledBack": true}));
    let engine = rollback_engine(ScriptedStep::pending(), rollback.clone()).await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(None)).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;
    assert_eq!(engine.step_of_kind(workflow.id, "x").await.status, StepStatus::Pending);

    let reconciler = Reconciler::new(Arc::clone(&engine.router), Duration::ZERO, HOUR);
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(
        report,
        ReconcileReport {
            timed_out: 1,
            retried: 0,
            failure_routed: 1,
            redispatched: 0,
        }
    );

    let x = engine.step_of_kind(workflow.id, "x").await;
    assert_eq!(x.status, StepStatus::Timeout);
    let children = engine.storage.children(x.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind, "rollbackX");
    assert_eq!(children[0].status, StepStatus::Queued);

    engine.drain(&mut receiver).await;
    assert_eq!(rollback.call_count(), 1);
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn retry_policy_creates_a_fresh_attempt_before_failing_over() {
    let x = ScriptedStep::pending_with_retries(1);
    let engine = rollback_engine(x.clone(), ScriptedStep::done(json!({}))).await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(None)).await;
    let reconciler = Reconciler::new(Arc::clone(&engine.router), Duration::ZERO, HOUR);

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let first = reconciler.sweep().await.unwrap();
    assert_eq!((first.timed_out, first.retried, first.failure_routed), (1, 1, 0));

    engine.drain(&mut receiver).await;
    assert_eq!(x.call_count(), 2);

    let second = reconciler.sweep().await.unwrap();
    assert_eq!((second.timed_out, second.retried, second.failure_routed), (1, 0, 1));

    let attempts: Vec<_> = engine
        .steps(workflow.id)
        .await
        .into_iter()
        .filter(|step| step.kind == "x")
        .collect();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|step| step.status == StepStatus::Timeout));
    assert!(attempts.iter().all(|step| step.parent_step_id == Some(init.id)));

    engine.drain(&mut receiver).await;
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn lost_queued_dispatch_is_published_again() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(None)).await;

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let dropped = receiver.try_recv().unwrap();
    assert_eq!(dropped.step_id, init.id);

    let reconciler = Reconciler::new(Arc::clone(&engine.router), HOUR, Duration::ZERO);
    let report = reconciler.sweep().await.unwrap();
    assert_eq!(report.redispatched, 1);
    assert_eq!(report.timed_out, 0);

    let again = receiver.try_recv().unwrap();
    assert_eq!(again, dropped);

    engine.drain(&mut receiver).await;
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn fresh_steps_are_left_alone() {
    let engine = rollback_engine(ScriptedStep::pending(), ScriptedStep::done(json!({}))).await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(None)).await;
    engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let reconciler = Reconciler::new(Arc::clone(&engine.router), HOUR, HOUR);
    assert_eq!(reconciler.sweep().await.unwrap(), ReconcileReport::default());
}

#[tokio::test]
async fn harness_retry_policy_is_honoured_by_the_sweep() {
    let mut registry = StepsConfigRegistry::new();
    registry.register(definitions::test::table().unwrap());
    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, S1, Arc::new(HarnessStep::new(S1).with_timeout_retries(1)))
        .register(WorkflowKind::Test, S2, Arc::new(HarnessStep::new(S2)));
    let engine = engine_with(registry, handlers).await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(None)).await;
    let reconciler = Reconciler::new(Arc::clone(&engine.router), Duration::ZERO, HOUR);

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({"pendingAt": S1}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let first = reconciler.sweep().await.unwrap();
    assert_eq!((first.retried, first.failure_routed), (1, 0));
    engine.drain(&mut receiver).await;

    let second = reconciler.sweep().await.unwrap();
    assert_eq!((second.retried, second.failure_routed), (0, 1));

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
    let attempts = engine
        .steps(workflow.id)
        .await
        .into_iter()
        .filter(|step| step.kind == S1)
        .count();
    assert_eq!(attempts, 2);
}

/// Deliver through the gate the way a lane worker does
async fn gated_advance(engine: &TestEngine, lane: &LaneKey, message: DispatchMessage) -> AdvanceOutcome {
    let sequence = message.sequence_number.unwrap();
    assert_eq!(
        engine.gate.check_and_advance_sequence(lane, sequence).await.unwrap(),
        SequenceCheck::Accepted {
            sequence_number: sequence
        }
    );
    engine
        .router
        .advance(message.workflow_id, message.step_id)
        .await
        .unwrap()
}

#[tokio::test]
async fn lost_branch_of_a_finished_workflow_still_consumes_its_sequence() {
    let config = StepsConfig::builder(WorkflowKind::Test)
        .step(INIT, StepTransition::new().on_success(["a"]))
        .step("a", StepTransition::new().on_success(["b", "c"]))
        .step("b", StepTransition::new().on_success([MARK_SUCCESS]))
        .step("c", StepTransition::new().on_success([MARK_SUCCESS]))
        .compile()
        .unwrap();
    let mut registry = StepsConfigRegistry::new();
    registry.register(config);
    let c = ScriptedStep::done(json!({}));
    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, "a", ScriptedStep::done(json!({})))
        .register(WorkflowKind::Test, "b", ScriptedStep::done(json!({})))
        .register(WorkflowKind::Test, "c", c.clone());
    let engine = engine_with(registry, handlers).await;

    let lane = LaneKey::workflow_router(None);
    engine.gate.register(&lane, &json!({}), 0).await.unwrap();
    let mut receiver = engine.subscribe(&lane).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    gated_advance(&engine, &lane, receiver.try_recv().unwrap()).await;
    gated_advance(&engine, &lane, receiver.try_recv().unwrap()).await;

    let b = receiver.try_recv().unwrap();
    let dropped = receiver.try_recv().unwrap();
    assert_eq!(dropped.sequence_number, Some(4));
    assert_eq!(
        gated_advance(&engine, &lane, b).await,
        AdvanceOutcome::Completed {
            status: WorkflowStatus::Completed
        }
    );

    let reconciler = Reconciler::new(Arc::clone(&engine.router), HOUR, Duration::ZERO);
    assert_eq!(reconciler.sweep().await.unwrap().redispatched, 1);

    let again = receiver.try_recv().unwrap();
    assert_eq!(again, dropped);
    assert_eq!(gated_advance(&engine, &lane, again).await, AdvanceOutcome::Abandoned);
    assert_eq!(c.call_count(), 0);

    // The lane keeps moving for the next workflow
    engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let next = receiver.try_recv().unwrap();
    assert_eq!(next.sequence_number, Some(5));
    gated_advance(&engine, &lane, next).await;

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
}
