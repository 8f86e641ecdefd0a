/// Workflow router
///
/// Advances one step at a time: loads state, runs the step implementation,
/// persists the outcome, asks the steps table for the next kind(s) and
/// creates and dispatches them. One router serves every workflow kind; kinds
/// differ only in their table and handler bindings.
///
/// Every outcome is persisted before successors are dispatched, and
/// successors are created at most once per parent, so re-delivered messages
/// are harmless.

use crate::{
    error::{EngineError, Result},
    lane::types::LaneKey,
    runtime::{
        dispatch::{DispatchMessage, Dispatcher},
        step::{StepError, StepHandlers, TaskStatus},
    },
    workflow::{
        registry::{StepTransition, StepsConfigRegistry},
        storage::WorkflowStorage,
        types::{
            chain_id_from, is_terminal_kind, merge_object, StepContext, StepStatus, Workflow,
            WorkflowKind, WorkflowStatus, WorkflowStep, INIT, MARK_FAILURE, MARK_SUCCESS,
        },
    },
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// What a single `advance` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum AdvanceOutcome {
    /// Step finished; these successors were created (or already existed)
    Advanced { successors: Vec<Uuid> },
    /// A terminal step ran and finalized the workflow
    Completed { status: WorkflowStatus },
    /// Step was already final; nothing executed
    AlreadyHandled,
    /// Implementation reported pending or a transient error; step stays pending
    Deferred,
    /// Unknown step kind or missing implementation; workflow failed
    Misconfigured,
    /// Workflow was already final; the step was closed without running
    Abandoned,
}

/// What the reconciliation sweep did with one stuck pending step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "resolution")]
pub enum TimeoutResolution {
    /// A fresh attempt of the same kind was created and dispatched
    Retried { step_id: Uuid },
    /// The failure edge was taken
    FailureRouted { outcome: AdvanceOutcome },
    /// The step moved on its own or its workflow is already final
    Skipped,
}

pub struct WorkflowRouter {
    storage: WorkflowStorage,
    registry: Arc<StepsConfigRegistry>,
    handlers: Arc<StepHandlers>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl std::fmt::Debug for WorkflowRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRouter")
            .field("kinds", &self.registry.kinds())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl WorkflowRouter {
    pub fn new(
        storage: WorkflowStorage,
        registry: Arc<StepsConfigRegistry>,
        handlers: Arc<StepHandlers>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            storage,
            registry,
            handlers,
            dispatcher,
        }
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Lane that advances `workflow`
    pub fn lane_for(workflow: &Workflow) -> LaneKey {
        LaneKey::workflow_router(workflow.chain_id())
    }

    /// Create a workflow with its `init` step and dispatch it
    pub async fn start(
        &self,
        kind: WorkflowKind,
        client_id: Option<i64>,
        request_params: Value,
    ) -> Result<(Workflow, WorkflowStep)> {
        if self.registry.get(kind).is_none() {
            return Err(EngineError::Configuration(format!(
                "Workflow kind {} is not enabled",
                kind
            )));
        }

        let lane = LaneKey::workflow_router(chain_id_from(&request_params));
        let (workflow, init) = self
            .storage
            .create_workflow(kind, client_id, request_params, Some(&lane))
            .await?;

        self.dispatch(&workflow, &init).await?;
        tracing::info!("🚀 Started {} workflow {} on lane {}", kind, workflow.id, lane);
        Ok((workflow, init))
    }

    /// Advance one step of a workflow
    pub async fn advance(&self, workflow_id: Uuid, step_id: Uuid) -> Result<AdvanceOutcome> {
        let workflow = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(workflow_id))?;
        let step = self
            .storage
            .get_step(step_id)
            .await?
            .ok_or(EngineError::StepNotFound(step_id))?;

        if step.workflow_id != workflow.id {
            return Err(EngineError::Configuration(format!(
                "Step {} belongs to workflow {}, not {}",
                step.id, step.workflow_id, workflow.id
            )));
        }

        if step.status.is_terminal() {
            tracing::debug!("🔁 Step {} ({}) already {}", step.id, step.kind, step.status.as_str());
            self.ensure_successors(&workflow, &step).await?;
            return Ok(AdvanceOutcome::AlreadyHandled);
        }

        // A sibling branch already finalized the workflow
        if workflow.status != WorkflowStatus::InProgress && !is_terminal_kind(&step.kind) {
            return self.abandon(&workflow, &step).await;
        }

        let Some(config) = self.registry.get(workflow.kind) else {
            let reason = format!("No steps table for workflow kind {}", workflow.kind);
            return self.fail_misconfigured(&workflow, &step, reason).await;
        };
        let Some(transition) = config.get(&step.kind).cloned() else {
            let reason = format!("Step kind '{}' is not in the {} table", step.kind, workflow.kind);
            return self.fail_misconfigured(&workflow, &step, reason).await;
        };

        if step.status == StepStatus::Queued
            && !self
                .storage
                .transition_step(step.id, StepStatus::Queued, StepStatus::Pending, None)
                .await?
        {
            tracing::debug!("🔁 Step {} was picked up by another delivery", step.id);
            return Ok(AdvanceOutcome::AlreadyHandled);
        }

        if is_terminal_kind(&step.kind) {
            return self.complete_terminal(&workflow, &step).await;
        }

        if step.kind == INIT {
            let started = json!({ "startedAt": Utc::now().to_rfc3339() });
            return self
                .finish(&workflow, &step, &transition, StepStatus::Processed, started)
                .await;
        }

        let Some(handler) = self.handlers.get(workflow.kind, &step.kind) else {
            let reason = format!("No step implementation for {}:{}", workflow.kind, step.kind);
            return self.fail_misconfigured(&workflow, &step, reason).await;
        };

        let ctx = self.build_context(&workflow, &step, &transition).await?;
        tracing::info!("⚙️ Performing {}:{} (step {})", workflow.kind, step.kind, step.id);

        match handler.perform(&ctx).await {
            Ok(outcome) => match outcome.task_status {
                TaskStatus::TaskDone => {
                    self.finish(&workflow, &step, &transition, StepStatus::Processed, outcome.task_response_data)
                        .await
                }
                TaskStatus::TaskFailed => {
                    self.finish(&workflow, &step, &transition, StepStatus::Failed, outcome.task_response_data)
                        .await
                }
                TaskStatus::TaskPending => {
                    self.storage
                        .record_pending_response(step.id, &outcome.task_response_data)
                        .await?;
                    tracing::info!("⏳ Step {} ({}) still in flight", step.id, step.kind);
                    Ok(AdvanceOutcome::Deferred)
                }
            },
            Err(StepError::Transient(reason)) => {
                tracing::warn!("⚠️ Transient error in step {} ({}): {}", step.id, step.kind, reason);
                Ok(AdvanceOutcome::Deferred)
            }
            Err(StepError::Invalid(reason)) => {
                tracing::warn!("❌ Step {} ({}) rejected its input: {}", step.id, step.kind, reason);
                self.finish(&workflow, &step, &transition, StepStatus::Failed, json!({ "error": reason }))
                    .await
            }
        }
    }

    /// Resolve a step left pending past the threshold
    ///
    /// Marks it `timeout`, then either retries it (when the implementation's
    /// policy allows another attempt under the same parent) or follows the
    /// failure edge.
    pub async fn reconcile_timeout(&self, step: &WorkflowStep) -> Result<TimeoutResolution> {
        let workflow = self
            .storage
            .get_workflow(step.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(step.workflow_id))?;

        let timed_out_at = json!({ "timedOutAt": Utc::now().to_rfc3339() });
        if !self
            .storage
            .transition_step(step.id, StepStatus::Pending, StepStatus::Timeout, Some(&timed_out_at))
            .await?
        {
            return Ok(TimeoutResolution::Skipped);
        }
        tracing::warn!("⏰ Step {} ({}) of workflow {} timed out", step.id, step.kind, workflow.id);

        if workflow.status != WorkflowStatus::InProgress {
            return Ok(TimeoutResolution::Skipped);
        }

        let mut timed_out = step.clone();
        timed_out.status = StepStatus::Timeout;

        let max_retries = self
            .handlers
            .get(workflow.kind, &step.kind)
            .map(|handler| handler.max_timeout_retries())
            .unwrap_or(0);
        let attempts = self
            .storage
            .count_attempts(workflow.id, step.parent_step_id, &step.kind, StepStatus::Timeout)
            .await?;

        if attempts <= i64::from(max_retries) {
            let retry = self
                .storage
                .insert_retry(&timed_out, Some(&Self::lane_for(&workflow)))
                .await?;
            self.dispatch(&workflow, &retry).await?;
            tracing::info!(
                "🔄 Retrying {} as step {} (attempt {} of {})",
                step.kind,
                retry.id,
                attempts + 1,
                max_retries + 1
            );
            return Ok(TimeoutResolution::Retried { step_id: retry.id });
        }

        let kinds = self
            .registry
            .get(workflow.kind)
            .and_then(|config| config.get(&step.kind).map(|t| t.successors_for(StepStatus::Timeout)))
            .unwrap_or_else(|| vec![MARK_FAILURE.to_string()]);
        let outcome = self.route_successors(&workflow, &timed_out, &kinds).await?;
        Ok(TimeoutResolution::FailureRouted { outcome })
    }

    /// Publish a queued step again; false when it is no longer queued
    ///
    /// Steps of an already final workflow are published too: the delivery
    /// consumes their lane sequence and `advance` abandons them.
    pub async fn redispatch(&self, step: &WorkflowStep) -> Result<bool> {
        let workflow = self
            .storage
            .get_workflow(step.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(step.workflow_id))?;

        if step.status != StepStatus::Queued {
            return Ok(false);
        }

        self.dispatch(&workflow, step).await?;
        tracing::info!("📮 Re-dispatched queued step {} ({})", step.id, step.kind);
        Ok(true)
    }

    /// Persist the final status of a pending step and route on it
    async fn finish(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        transition: &StepTransition,
        status: StepStatus,
        response_data: Value,
    ) -> Result<AdvanceOutcome> {
        if !self
            .storage
            .transition_step(step.id, StepStatus::Pending, status, Some(&response_data))
            .await?
        {
            tracing::debug!("🔁 Step {} finished concurrently", step.id);
            return Ok(AdvanceOutcome::AlreadyHandled);
        }

        match status {
            StepStatus::Processed => {
                tracing::info!("✅ Step {} ({}) processed", step.id, step.kind)
            }
            _ => tracing::warn!("❌ Step {} ({}) ended {}", step.id, step.kind, status.as_str()),
        }

        let mut finished = step.clone();
        finished.status = status;
        finished.response_data = Some(response_data);

        let kinds = transition.successors_for(status);
        self.route_successors(workflow, &finished, &kinds).await
    }

    /// Create (at most once) and hand off the successors of a final step
    async fn route_successors(
        &self,
        workflow: &Workflow,
        parent: &WorkflowStep,
        kinds: &[String],
    ) -> Result<AdvanceOutcome> {
        let lane = Self::lane_for(workflow);
        let successors = self.storage.insert_successors(parent, kinds, Some(&lane)).await?;

        if !successors.created {
            tracing::debug!("🔁 Successors of step {} already exist", parent.id);
        }

        let mut completed = None;
        for step in &successors.steps {
            if is_terminal_kind(&step.kind) {
                if !step.status.is_terminal() {
                    if let AdvanceOutcome::Completed { status } =
                        self.complete_terminal(workflow, step).await?
                    {
                        completed = Some(status);
                    }
                }
            } else if successors.created {
                self.dispatch(workflow, step).await?;
            }
        }

        Ok(match completed {
            Some(status) => AdvanceOutcome::Completed { status },
            None => AdvanceOutcome::Advanced {
                successors: successors.steps.iter().map(|step| step.id).collect(),
            },
        })
    }

    /// Idempotent successor creation for a re-delivered final step
    async fn ensure_successors(&self, workflow: &Workflow, step: &WorkflowStep) -> Result<()> {
        // Timed-out steps are routed by the sweep, which may have retried them instead
        if step.status == StepStatus::Timeout || is_terminal_kind(&step.kind) {
            return Ok(());
        }
        if workflow.status != WorkflowStatus::InProgress {
            return Ok(());
        }

        let Some(transition) = self
            .registry
            .get(workflow.kind)
            .and_then(|config| config.get(&step.kind).cloned())
        else {
            return Ok(());
        };

        self.route_successors(workflow, step, &transition.successors_for(step.status))
            .await?;
        Ok(())
    }

    /// Run a `markSuccess`/`markFailure` step and finalize the workflow
    async fn complete_terminal(&self, workflow: &Workflow, step: &WorkflowStep) -> Result<AdvanceOutcome> {
        if step.status == StepStatus::Queued {
            self.storage
                .transition_step(step.id, StepStatus::Queued, StepStatus::Pending, None)
                .await?;
        }
        let finalized_at = json!({ "finalizedAt": Utc::now().to_rfc3339() });
        self.storage
            .transition_step(step.id, StepStatus::Pending, StepStatus::Processed, Some(&finalized_at))
            .await?;

        let status = if step.kind == MARK_SUCCESS {
            WorkflowStatus::Completed
        } else {
            WorkflowStatus::Failed
        };

        if self.storage.finalize_workflow(workflow.id, status).await? {
            match status {
                WorkflowStatus::Completed => {
                    tracing::info!("🎉 Workflow {} ({}) completed", workflow.id, workflow.kind)
                }
                _ => tracing::warn!("💥 Workflow {} ({}) failed", workflow.id, workflow.kind),
            }
            return Ok(AdvanceOutcome::Completed { status });
        }

        // Another branch reached its terminal first; report what stuck
        let current = self
            .storage
            .get_workflow(workflow.id)
            .await?
            .map(|stored| stored.status)
            .unwrap_or(status);
        tracing::debug!("🔁 Workflow {} was already {}", workflow.id, current.as_str());
        Ok(AdvanceOutcome::Completed { status: current })
    }

    /// Close a step of a final workflow as failed without running it; no successors
    async fn abandon(&self, workflow: &Workflow, step: &WorkflowStep) -> Result<AdvanceOutcome> {
        if step.status == StepStatus::Queued
            && !self
                .storage
                .transition_step(step.id, StepStatus::Queued, StepStatus::Pending, None)
                .await?
        {
            return Ok(AdvanceOutcome::AlreadyHandled);
        }

        let abandoned = json!({ "abandoned": true, "workflowStatus": workflow.status.as_str() });
        if !self
            .storage
            .transition_step(step.id, StepStatus::Pending, StepStatus::Failed, Some(&abandoned))
            .await?
        {
            return Ok(AdvanceOutcome::AlreadyHandled);
        }

        tracing::warn!(
            "🪦 Abandoned step {} ({}): workflow {} is already {}",
            step.id,
            step.kind,
            workflow.id,
            workflow.status.as_str()
        );
        Ok(AdvanceOutcome::Abandoned)
    }

    /// Configuration errors are fatal: fail the step and the workflow, no successors
    async fn fail_misconfigured(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        reason: String,
    ) -> Result<AdvanceOutcome> {
        tracing::error!("❌ Workflow {} misconfigured: {}", workflow.id, reason);

        if step.status == StepStatus::Queued {
            self.storage
                .transition_step(step.id, StepStatus::Queued, StepStatus::Pending, None)
                .await?;
        }
        self.storage
            .transition_step(
                step.id,
                StepStatus::Pending,
                StepStatus::Failed,
                Some(&json!({ "error": reason })),
            )
            .await?;
        self.storage
            .finalize_workflow(workflow.id, WorkflowStatus::Failed)
            .await?;

        Ok(AdvanceOutcome::Misconfigured)
    }

    /// Workflow params, then step params, then the nearest ancestor response of
    /// each `read_data_from` kind in declaration order
    async fn build_context(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        transition: &StepTransition,
    ) -> Result<StepContext> {
        let mut input = Map::new();
        merge_object(&mut input, &workflow.request_params);
        merge_object(&mut input, &step.request_params);

        if !transition.read_data_from.is_empty() {
            let ancestors = self.storage.ancestors(step.id).await?;
            for source in &transition.read_data_from {
                let response = ancestors
                    .iter()
                    .find(|ancestor| &ancestor.kind == source)
                    .and_then(|ancestor| ancestor.response_data.as_ref());
                match response {
                    Some(data) => merge_object(&mut input, data),
                    None => tracing::debug!("📭 No response data from '{}' for step {}", source, step.id),
                }
            }
        }

        Ok(StepContext {
            workflow_id: workflow.id,
            step_id: step.id,
            workflow_kind: workflow.kind,
            step_kind: step.kind.clone(),
            client_id: workflow.client_id,
            chain_id: workflow.chain_id(),
            input: Value::Object(input),
        })
    }

    async fn dispatch(&self, workflow: &Workflow, step: &WorkflowStep) -> Result<()> {
        self.dispatcher
            .publish(DispatchMessage {
                workflow_id: workflow.id,
                step_id: step.id,
                chain_id: workflow.chain_id(),
                topic: Self::lane_for(workflow).to_string(),
                sequence_number: step.sequence_number,
            })
            .await
    }
}
