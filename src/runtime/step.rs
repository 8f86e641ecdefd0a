/// Step implementation contract
///
/// A step implementation performs one unit of business work for a
/// (workflow kind, step kind) pair and reports a uniform outcome. The router
/// owns every status change; implementations only return what happened.

use crate::{
    error::{EngineError, Result},
    workflow::{
        registry::StepsConfig,
        types::{is_terminal_kind, StepContext, WorkflowKind, INIT},
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

/// How the unit of work ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    TaskDone,
    TaskFailed,
    /// Still in flight (e.g. an unconfirmed transaction); the step stays pending
    TaskPending,
}

/// Uniform result of a step implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub task_status: TaskStatus,
    pub task_response_data: Value,
}

impl StepOutcome {
    pub fn done(task_response_data: Value) -> Self {
        Self {
            task_status: TaskStatus::TaskDone,
            task_response_data,
        }
    }

    pub fn failed(task_response_data: Value) -> Self {
        Self {
            task_status: TaskStatus::TaskFailed,
            task_response_data,
        }
    }

    pub fn pending(task_response_data: Value) -> Self {
        Self {
            task_status: TaskStatus::TaskPending,
            task_response_data,
        }
    }

    /// Failed outcome carrying just an error message
    pub fn failed_with(reason: impl fmt::Display) -> Self {
        Self::failed(json!({ "error": reason.to_string() }))
    }
}

/// Errors a step implementation may raise instead of an outcome
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Network blip, rate limit, node unavailable: leave the step pending
    #[error("Transient step error: {0}")]
    Transient(String),

    /// Input the step can never succeed with; routed like a failed task
    #[error("Invalid step input: {0}")]
    Invalid(String),
}

/// One pluggable unit of business work
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn perform(&self, ctx: &StepContext) -> std::result::Result<StepOutcome, StepError>;

    /// Times a timed-out attempt may be retried before the failure edge is taken
    fn max_timeout_retries(&self) -> u32 {
        0
    }
}

/// Typed handler registry: (workflow kind, step kind) → implementation
#[derive(Clone, Default)]
pub struct StepHandlers {
    handlers: HashMap<(WorkflowKind, String), Arc<dyn StepHandler>>,
}

impl fmt::Debug for StepHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self
            .handlers
            .keys()
            .map(|(kind, step)| format!("{}:{}", kind, step))
            .collect();
        keys.sort();
        f.debug_struct("StepHandlers").field("handlers", &keys).finish()
    }
}

impl StepHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an implementation; a later binding for the same pair replaces the earlier one
    pub fn register(
        &mut self,
        kind: WorkflowKind,
        step_kind: impl Into<String>,
        handler: Arc<dyn StepHandler>,
    ) -> &mut Self {
        self.handlers.insert((kind, step_kind.into()), handler);
        self
    }

    pub fn get(&self, kind: WorkflowKind, step_kind: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&(kind, step_kind.to_string())).cloned()
    }

    /// Fail fast when the bindings of `kind` do not match its steps table
    ///
    /// Every domain step kind needs an implementation; `init` and the
    /// terminals are run by the router itself and must not have one.
    pub fn validate(&self, kind: WorkflowKind, config: &StepsConfig) -> Result<()> {
        let mut missing: Vec<&str> = config
            .step_kinds()
            .filter(|step_kind| *step_kind != INIT && !is_terminal_kind(step_kind))
            .filter(|step_kind| self.get(kind, step_kind).is_none())
            .collect();
        missing.sort_unstable();
        if !missing.is_empty() {
            return Err(EngineError::Configuration(format!(
                "No step implementation for {} step(s): {}",
                kind,
                missing.join(", ")
            )));
        }

        let mut unknown: Vec<&str> = self
            .handlers
            .keys()
            .filter(|(bound_kind, _)| *bound_kind == kind)
            .map(|(_, step_kind)| step_kind.as_str())
            .filter(|step_kind| {
                *step_kind == INIT || is_terminal_kind(step_kind) || !config.contains(step_kind)
            })
            .collect();
        unknown.sort_unstable();
        if !unknown.is_empty() {
            return Err(EngineError::Configuration(format!(
                "Step implementation(s) bound outside the {} table: {}",
                kind,
                unknown.join(", ")
            )));
        }

        tracing::debug!("✅ Step implementations for {} match its table", kind);
        Ok(())
    }
}
