#![allow(dead_code)]

use async_trait::async_trait;
use economyflow::{
    database,
    lane::{gate::SequenceGate, storage::CronProcessStorage, types::LaneKey},
    runtime::{
        dispatch::{ChannelDispatcher, DispatchMessage},
        router::{AdvanceOutcome, WorkflowRouter},
        step::{StepError, StepHandler, StepHandlers, StepOutcome},
    },
    steps::test_harness,
    workflow::{
        definitions,
        registry::StepsConfigRegistry,
        storage::WorkflowStorage,
        types::{StepContext, WorkflowStep},
    },
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub struct TestEngine {
    pub pool: SqlitePool,
    pub storage: WorkflowStorage,
    pub router: Arc<WorkflowRouter>,
    pub gate: Arc<SequenceGate>,
    pub dispatcher: Arc<ChannelDispatcher>,
}

/// Engine on a fresh in-memory database with the given tables and handlers
pub async fn engine_with(registry: StepsConfigRegistry, handlers: StepHandlers) -> TestEngine {
    init_tracing();
    let pool = database::connect_in_memory().await.unwrap();
    let storage = WorkflowStorage::new(pool.clone());
    let dispatcher = Arc::new(ChannelDispatcher::new());
    let router = Arc::new(WorkflowRouter::new(
        storage.clone(),
        Arc::new(registry),
        Arc::new(handlers),
        dispatcher.clone(),
    ));
    let gate = Arc::new(SequenceGate::new(CronProcessStorage::new(pool.clone())));

    TestEngine {
        pool,
        storage,
        router,
        gate,
        dispatcher,
    }
}

/// Engine running the built-in `test` kind with the harness steps
pub async fn test_engine() -> TestEngine {
    let mut registry = StepsConfigRegistry::new();
    registry.register(definitions::test::table().unwrap());
    let mut handlers = StepHandlers::new();
    test_harness::register(&mut handlers);
    engine_with(registry, handlers).await
}

impl TestEngine {
    pub async fn subscribe(&self, lane: &LaneKey) -> UnboundedReceiver<DispatchMessage> {
        self.dispatcher.subscribe(&lane.to_string()).await.unwrap()
    }

    /// Advance every dispatched message until the topic is quiet, bypassing the gate
    pub async fn drain(
        &self,
        receiver: &mut UnboundedReceiver<DispatchMessage>,
    ) -> Vec<(DispatchMessage, AdvanceOutcome)> {
        let mut handled = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            let outcome = self
                .router
                .advance(message.workflow_id, message.step_id)
                .await
                .unwrap();
            handled.push((message, outcome));
        }
        handled
    }

    pub async fn steps(&self, workflow_id: Uuid) -> Vec<WorkflowStep> {
        self.storage.list_steps(workflow_id).await.unwrap()
    }

    pub async fn step_of_kind(&self, workflow_id: Uuid, kind: &str) -> WorkflowStep {
        self.steps(workflow_id)
            .await
            .into_iter()
            .find(|step| step.kind == kind)
            .unwrap_or_else(|| panic!("no '{}' step in workflow {}", kind, workflow_id))
    }
}

/// Step implementation returning a fixed outcome and counting calls
pub struct ScriptedStep {
    outcome: Result<StepOutcome, StepError>,
    retries: u32,
    pub calls: AtomicUsize,
}

impl ScriptedStep {
    pub fn done(data: Value) -> Arc<Self> {
        Self::with(Ok(StepOutcome::done(data)), 0)
    }

    pub fn failed(data: Value) -> Arc<Self> {
        Self::with(Ok(StepOutcome::failed(data)), 0)
    }

    pub fn pending() -> Arc<Self> {
        Self::with(Ok(StepOutcome::pending(Value::Null)), 0)
    }

    pub fn pending_with_retries(retries: u32) -> Arc<Self> {
        Self::with(Ok(StepOutcome::pending(Value::Null)), retries)
    }

    fn with(outcome: Result<StepOutcome, StepError>, retries: u32) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            retries,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepHandler for ScriptedStep {
    async fn perform(&self, _ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    fn max_timeout_retries(&self) -> u32 {
        self.retries
    }
}

/// Step implementation that records the input it was given
#[derive(Default)]
pub struct RecordingStep {
    pub seen: tokio::sync::Mutex<Vec<Value>>,
}

#[async_trait]
impl StepHandler for RecordingStep {
    async fn perform(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        self.seen.lock().await.push(ctx.input.clone());
        Ok(StepOutcome::done(Value::Null))
    }
}
