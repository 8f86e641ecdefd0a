mod common;

use common::{engine_with, test_engine, RecordingStep, ScriptedStep};
use economyflow::{
    error::EngineError,
    lane::types::LaneKey,
    runtime::{router::AdvanceOutcome, step::StepHandlers},
    workflow::{
        registry::{StepTransition, StepsConfig, StepsConfigRegistry},
        types::{StepStatus, WorkflowKind, WorkflowStatus, INIT, MARK_FAILURE, MARK_SUCCESS},
    },
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn chainless() -> LaneKey {
    LaneKey::workflow_router(None)
}

fn registry_of(config: StepsConfig) -> StepsConfigRegistry {
    let mut registry = StepsConfigRegistry::new();
    registry.register(config);
    registry
}

#[tokio::test]
async fn linear_test_workflow_completes() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, Some(1), json!({"echo": "hi"}))
        .await
        .unwrap();
    assert_eq!(workflow.status, WorkflowStatus::InProgress);
    assert_eq!(init.kind, INIT);

    let handled = engine.drain(&mut receiver).await;
    let outcomes: Vec<_> = handled.into_iter().map(|(_, outcome)| outcome).collect();
    assert_eq!(outcomes.len(), 3, "init, s1 and s2 are dispatched; markSuccess runs inline");
    assert_eq!(
        outcomes.last(),
        Some(&AdvanceOutcome::Completed {
            status: WorkflowStatus::Completed
        })
    );

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);

    let steps = engine.steps(workflow.id).await;
    let kinds: Vec<_> = steps.iter().map(|step| step.kind.as_str()).collect();
    assert_eq!(kinds, vec![INIT, "s1", "s2", MARK_SUCCESS]);
    assert!(steps.iter().all(|step| step.status == StepStatus::Processed));

    // Each step hangs off the one before it
    for pair in steps.windows(2) {
        assert_eq!(pair[1].parent_step_id, Some(pair[0].id));
    }

    let s2 = engine.step_of_kind(workflow.id, "s2").await;
    assert_eq!(s2.response_data.unwrap()["s2Result"]["echo"], "hi");
}

#[tokio::test]
async fn task_failed_creates_exactly_the_failure_successor() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({"failAt": "s1"}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let s1 = engine.step_of_kind(workflow.id, "s1").await;
    assert_eq!(s1.status, StepStatus::Failed);

    let children = engine.storage.children(s1.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind, MARK_FAILURE);
    assert_eq!(children[0].status, StepStatus::Processed);

    assert!(engine.steps(workflow.id).await.iter().all(|step| step.kind != "s2"));
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn invalid_input_is_routed_like_a_failure() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({"invalidAt": "s1"}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let s1 = engine.step_of_kind(workflow.id, "s1").await;
    assert_eq!(s1.status, StepStatus::Failed);
    assert!(s1.response_data.unwrap()["error"].as_str().unwrap().contains("reject"));
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn re_advancing_a_processed_step_creates_nothing() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let before = engine.steps(workflow.id).await;
    let s1 = engine.step_of_kind(workflow.id, "s1").await;

    let outcome = engine.router.advance(workflow.id, s1.id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::AlreadyHandled);
    assert_eq!(engine.steps(workflow.id).await.len(), before.len());
    assert!(receiver.try_recv().is_err(), "nothing is dispatched again");
}

#[tokio::test]
async fn redelivery_after_a_lost_dispatch_recreates_nothing() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();

    // init runs, its s1 message is dropped, then init is delivered again
    let init_message = receiver.try_recv().unwrap();
    engine.router.advance(init_message.workflow_id, init_message.step_id).await.unwrap();
    let lost = receiver.try_recv().unwrap();

    let outcome = engine.router.advance(workflow.id, init.id).await.unwrap();
    assert_eq!(outcome, AdvanceOutcome::AlreadyHandled);

    let s1_rows: Vec<_> = engine
        .steps(workflow.id)
        .await
        .into_iter()
        .filter(|step| step.kind == "s1")
        .collect();
    assert_eq!(s1_rows.len(), 1);
    assert_eq!(s1_rows[0].id, lost.step_id);
}

fn fan_out_config() -> StepsConfig {
    StepsConfig::builder(WorkflowKind::Test)
        .step(INIT, StepTransition::new().on_success(["a"]))
        .step("a", StepTransition::new().on_success(["b", "c"]))
        .step("b", StepTransition::new().on_success([MARK_SUCCESS]))
        .step("c", StepTransition::new().on_success([MARK_SUCCESS]))
        .compile()
        .unwrap()
}

#[tokio::test]
async fn fan_out_dispatches_every_branch_and_the_first_terminal_wins() {
    let c = ScriptedStep::done(json!({"c": true}));
    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, "a", ScriptedStep::done(json!({"a": true})))
        .register(WorkflowKind::Test, "b", ScriptedStep::done(json!({"b": true})))
        .register(WorkflowKind::Test, "c", c.clone());

    let engine = engine_with(registry_of(fan_out_config()), handlers).await;
    let mut receiver = engine.subscribe(&chainless()).await;
    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let handled = engine.drain(&mut receiver).await;

    let a = engine.step_of_kind(workflow.id, "a").await;
    let branches: Vec<_> = engine
        .storage
        .children(a.id)
        .await
        .unwrap()
        .into_iter()
        .map(|step| step.kind)
        .collect();
    assert_eq!(branches, vec!["b", "c"]);

    let c_step = engine.step_of_kind(workflow.id, "c").await;
    assert!(handled.iter().any(|(message, _)| message.step_id == c_step.id));

    // b finalized the workflow before c was delivered
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Completed);
    assert_eq!(c.call_count(), 0);
    assert_eq!(c_step.status, StepStatus::Failed);
    assert_eq!(c_step.response_data.unwrap()["abandoned"], true);
}

#[tokio::test]
async fn failed_branch_stops_its_siblings() {
    let c = ScriptedStep::done(json!({"c": true}));
    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, "a", ScriptedStep::done(json!({})))
        .register(WorkflowKind::Test, "b", ScriptedStep::failed(json!({"reverted": true})))
        .register(WorkflowKind::Test, "c", c.clone());

    let engine = engine_with(registry_of(fan_out_config()), handlers).await;
    let mut receiver = engine.subscribe(&chainless()).await;
    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let handled = engine.drain(&mut receiver).await;

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);

    let c_step = engine.step_of_kind(workflow.id, "c").await;
    let (_, outcome) = handled
        .iter()
        .find(|(message, _)| message.step_id == c_step.id)
        .unwrap();
    assert_eq!(outcome, &AdvanceOutcome::Abandoned);
    assert_eq!(c.call_count(), 0, "sibling never runs after the workflow failed");
    assert_eq!(c_step.status, StepStatus::Failed);
    assert_eq!(
        c_step.response_data.unwrap(),
        json!({"abandoned": true, "workflowStatus": "failed"})
    );
    assert!(engine.storage.children(c_step.id).await.unwrap().is_empty());

    // Re-delivery of the abandoned step creates nothing
    let again = engine.router.advance(workflow.id, c_step.id).await.unwrap();
    assert_eq!(again, AdvanceOutcome::AlreadyHandled);
    assert!(engine.storage.children(c_step.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn read_data_from_merges_ancestor_responses_over_params() {
    let config = StepsConfig::builder(WorkflowKind::Test)
        .step(INIT, StepTransition::new().on_success(["a"]))
        .step("a", StepTransition::new().on_success(["b"]))
        .step(
            "b",
            StepTransition::new().on_success([MARK_SUCCESS]).read_data_from(["a"]),
        )
        .compile()
        .unwrap();
    let recorder = Arc::new(RecordingStep::default());
    let mut handlers = StepHandlers::new();
    handlers
        .register(
            WorkflowKind::Test,
            "a",
            ScriptedStep::done(json!({"token": "0xabc", "echo": "from-a"})),
        )
        .register(WorkflowKind::Test, "b", recorder.clone());

    let engine = engine_with(registry_of(config), handlers).await;
    let mut receiver = engine.subscribe(&LaneKey::workflow_router(Some(1409))).await;
    engine
        .router
        .start(
            WorkflowKind::Test,
            Some(3),
            json!({"chainId": 1409, "echo": "from-workflow", "clientLevel": 1}),
        )
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let seen = recorder.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["echo"], "from-a");
    assert_eq!(seen[0]["token"], "0xabc");
    assert_eq!(seen[0]["clientLevel"], 1);
    assert_eq!(seen[0]["chainId"], 1409);
}

#[tokio::test]
async fn missing_implementation_fails_the_workflow() {
    let mut handlers = StepHandlers::new();
    handlers.register(
        WorkflowKind::Test,
        "s1",
        ScriptedStep::done(json!({"s1Result": {}})),
    );
    let engine = engine_with(
        registry_of(economyflow::workflow::definitions::test::table().unwrap()),
        handlers,
    )
    .await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let outcomes: Vec<_> = engine
        .drain(&mut receiver)
        .await
        .into_iter()
        .map(|(_, outcome)| outcome)
        .collect();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Misconfigured));

    let s2 = engine.step_of_kind(workflow.id, "s2").await;
    assert_eq!(s2.status, StepStatus::Failed);
    assert!(engine.storage.children(s2.id).await.unwrap().is_empty());

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn disabled_kind_cannot_start() {
    let engine = test_engine().await;
    let error = engine
        .router
        .start(WorkflowKind::Grant, Some(1), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::Configuration(_)));
}

#[tokio::test]
async fn transient_errors_leave_the_step_pending() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({"transientAt": "s1"}))
        .await
        .unwrap();
    let outcomes: Vec<_> = engine
        .drain(&mut receiver)
        .await
        .into_iter()
        .map(|(_, outcome)| outcome)
        .collect();
    assert_eq!(outcomes.last(), Some(&AdvanceOutcome::Deferred));

    let s1 = engine.step_of_kind(workflow.id, "s1").await;
    assert_eq!(s1.status, StepStatus::Pending);
    assert!(engine.storage.children(s1.id).await.unwrap().is_empty());

    // A re-delivered pending step is retried in place
    let again = engine.router.advance(workflow.id, s1.id).await.unwrap();
    assert_eq!(again, AdvanceOutcome::Deferred);
    assert_eq!(engine.steps(workflow.id).await.len(), 2);
}

#[tokio::test]
async fn task_pending_records_interim_response() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({"pendingAt": "s2"}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let s2 = engine.step_of_kind(workflow.id, "s2").await;
    assert_eq!(s2.status, StepStatus::Pending);
    assert_eq!(s2.response_data, Some(json!({"waiting": "s2"})));
    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::InProgress);
}

#[tokio::test]
async fn step_status_never_moves_backward() {
    let engine = test_engine().await;
    let mut receiver = engine.subscribe(&chainless()).await;

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    assert!(engine
        .storage
        .transition_step(init.id, StepStatus::Processed, StepStatus::Pending, None)
        .await
        .is_err());
    assert!(!engine
        .storage
        .transition_step(init.id, StepStatus::Queued, StepStatus::Pending, None)
        .await
        .unwrap());
    assert!(!engine
        .storage
        .transition_step(init.id, StepStatus::Pending, StepStatus::Failed, None)
        .await
        .unwrap());

    let init = engine.storage.get_step(init.id).await.unwrap().unwrap();
    assert_eq!(init.status, StepStatus::Processed);
    assert!(init.response_data.unwrap().get("startedAt").is_some());
    assert_eq!(
        engine.storage.get_workflow(workflow.id).await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn registered_lane_stamps_sequences_on_dispatched_steps() {
    let engine = test_engine().await;
    let lane = chainless();
    engine.gate.register(&lane, &json!({"chainId": 0}), 5).await.unwrap();
    let mut receiver = engine.subscribe(&lane).await;

    let (workflow, init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    assert_eq!(init.sequence_number, Some(6));

    let sequences: Vec<_> = engine
        .drain(&mut receiver)
        .await
        .into_iter()
        .map(|(message, _)| message.sequence_number)
        .collect();
    assert_eq!(sequences, vec![Some(6), Some(7), Some(8)]);

    let terminal = engine.step_of_kind(workflow.id, MARK_SUCCESS).await;
    assert_eq!(terminal.sequence_number, None);
    assert_eq!(engine.gate.lane(&lane).await.unwrap().unwrap().issued_sequence, 8);
}

#[tokio::test]
async fn advance_checks_ownership_and_existence() {
    let engine = test_engine().await;
    let (first, first_init) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    let (second, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();

    let error = engine.router.advance(second.id, first_init.id).await.unwrap_err();
    assert!(matches!(error, EngineError::Configuration(_)));

    let missing = Uuid::new_v4();
    let error = engine.router.advance(missing, first_init.id).await.unwrap_err();
    assert!(matches!(error, EngineError::WorkflowNotFound(id) if id == missing));

    let error = engine.router.advance(first.id, missing).await.unwrap_err();
    assert!(matches!(error, EngineError::StepNotFound(id) if id == missing));
}

#[tokio::test]
async fn failure_edge_overrides_mark_failure() {
    let config = StepsConfig::builder(WorkflowKind::Test)
        .step(INIT, StepTransition::new().on_success(["deploy"]))
        .step(
            "deploy",
            StepTransition::new().on_success([MARK_SUCCESS]).on_failure("rollbackDeploy"),
        )
        .step("rollbackDeploy", StepTransition::new().on_success([MARK_FAILURE]))
        .compile()
        .unwrap();
    let rollback = ScriptedStep::done(json!({"rolledBack": true}));
    let mut handlers = StepHandlers::new();
    handlers
        .register(WorkflowKind::Test, "deploy", ScriptedStep::failed(json!({"reason": "reverted"})))
        .register(WorkflowKind::Test, "rollbackDeploy", rollback.clone());

    let engine = engine_with(registry_of(config), handlers).await;
    let mut receiver = engine.subscribe(&chainless()).await;
    let (workflow, _) = engine
        .router
        .start(WorkflowKind::Test, None, json!({}))
        .await
        .unwrap();
    engine.drain(&mut receiver).await;

    let deploy = engine.step_of_kind(workflow.id, "deploy").await;
    let children = engine.storage.children(deploy.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].kind, "rollbackDeploy");
    assert_eq!(rollback.call_count(), 1);

    let stored = engine.storage.get_workflow(workflow.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkflowStatus::Failed);
}
