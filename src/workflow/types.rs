/// Core workflow type definitions
///
/// Workflows and their steps as persisted in the `workflows` and
/// `workflow_steps` tables, plus the immutable context handed to step
/// implementations.

use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Entry step kind present in every steps table
pub const INIT: &str = "init";
/// Universal terminal: finalizes the workflow as completed
pub const MARK_SUCCESS: &str = "markSuccess";
/// Universal terminal: finalizes the workflow as failed
pub const MARK_FAILURE: &str = "markFailure";

/// Whether a step kind is one of the two universal terminals
pub fn is_terminal_kind(kind: &str) -> bool {
    kind == MARK_SUCCESS || kind == MARK_FAILURE
}

/// Enumerated business process types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowKind {
    /// Deploy the token organization, branded token and gateway contracts
    TokenDeploy,
    /// Stake on the origin chain and mint on the auxiliary chain
    StakeAndMint,
    /// Fund a sandbox client with base currency and OST
    Grant,
    /// Commit the origin chain state root onto an auxiliary chain
    StateRootSync,
    /// Device recovery / authorize / revoke actions
    RecoveryAction,
    /// Engine test harness
    Test,
}

impl WorkflowKind {
    pub const ALL: [WorkflowKind; 6] = [
        WorkflowKind::TokenDeploy,
        WorkflowKind::StakeAndMint,
        WorkflowKind::Grant,
        WorkflowKind::StateRootSync,
        WorkflowKind::RecoveryAction,
        WorkflowKind::Test,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::TokenDeploy => "tokenDeploy",
            WorkflowKind::StakeAndMint => "stakeAndMint",
            WorkflowKind::Grant => "grant",
            WorkflowKind::StateRootSync => "stateRootSync",
            WorkflowKind::RecoveryAction => "recoveryAction",
            WorkflowKind::Test => "test",
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkflowKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EngineError::Configuration(format!("Unknown workflow kind: {}", s)))
    }
}

/// Overall workflow status, derived from its terminal step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowStatus {
    InProgress,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "inProgress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inProgress" => Ok(WorkflowStatus::InProgress),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            other => Err(EngineError::CorruptRecord(format!("workflow status '{}'", other))),
        }
    }
}

/// Step status; moves only forward: queued → pending → {processed | failed | timeout}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Queued,
    Pending,
    Processed,
    Failed,
    Timeout,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Pending => "pending",
            StepStatus::Processed => "processed",
            StepStatus::Failed => "failed",
            StepStatus::Timeout => "timeout",
        }
    }

    /// processed/failed/timeout are final for the row
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Processed | StepStatus::Failed | StepStatus::Timeout
        )
    }
}

impl FromStr for StepStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(StepStatus::Queued),
            "pending" => Ok(StepStatus::Pending),
            "processed" => Ok(StepStatus::Processed),
            "failed" => Ok(StepStatus::Failed),
            "timeout" => Ok(StepStatus::Timeout),
            other => Err(EngineError::CorruptRecord(format!("step status '{}'", other))),
        }
    }
}

/// One instance of a business process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: Uuid,
    pub kind: WorkflowKind,
    /// Tenant owner; None for chain-level workflows such as state root sync
    pub client_id: Option<i64>,
    /// Business inputs: addresses, amounts, chain ids
    pub request_params: Value,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Chain the workflow operates on, used to pick its lane
    pub fn chain_id(&self) -> Option<u64> {
        chain_id_from(&self.request_params)
    }
}

/// One node in a workflow's execution DAG
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub kind: String,
    pub status: StepStatus,
    /// Predecessor that produced this step; None for `init`
    pub parent_step_id: Option<Uuid>,
    pub request_params: Value,
    pub response_data: Option<Value>,
    /// Lane sequence stamped at creation when the workflow's lane is registered
    pub sequence_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable input for a single step implementation call
///
/// Built by the router from the workflow row, the step row and the response
/// data of the ancestors named in the step's `read_data_from`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepContext {
    pub workflow_id: Uuid,
    pub step_id: Uuid,
    pub workflow_kind: WorkflowKind,
    pub step_kind: String,
    pub client_id: Option<i64>,
    pub chain_id: Option<u64>,
    /// Merged JSON object: workflow params, then step params, then ancestor responses
    pub input: Value,
}

impl StepContext {
    /// Raw lookup of a merged input field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.input.get(key)
    }

    /// Typed lookup of a merged input field; None when absent or of another shape
    pub fn param<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// Shallow-merge `overlay`'s fields into `base`; non-object overlays are ignored
pub fn merge_object(base: &mut Map<String, Value>, overlay: &Value) {
    if let Value::Object(fields) = overlay {
        for (key, value) in fields {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Extract the chain id from request params ("chainId", then "auxChainId", then "originChainId").
/// Accepts numbers and numeric strings.
pub fn chain_id_from(params: &Value) -> Option<u64> {
    ["chainId", "auxChainId", "originChainId"]
        .iter()
        .filter_map(|key| params.get(*key))
        .find_map(|value| match value {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.parse().ok(),
            _ => None,
        })
}
