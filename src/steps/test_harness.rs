/// Test harness steps
///
/// `s1` and `s2` of the `test` workflow kind. Their outcome is steered by the
/// workflow's request params, naming the step kind that should misbehave:
/// - `failAt`: report `taskFailed`
/// - `pendingAt`: report `taskPending`
/// - `transientAt`: raise a transient error
/// - `invalidAt`: reject the input
///
/// `s2` reads `s1Result` through `readDataFrom` and rejects its input when it
/// is missing.

use crate::{
    runtime::step::{StepError, StepHandler, StepHandlers, StepOutcome},
    workflow::{
        definitions::test::{S1, S2},
        types::{StepContext, WorkflowKind},
    },
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct HarnessStep {
    kind: &'static str,
    max_timeout_retries: u32,
}

impl HarnessStep {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            max_timeout_retries: 0,
        }
    }

    pub fn with_timeout_retries(mut self, retries: u32) -> Self {
        self.max_timeout_retries = retries;
        self
    }

    fn targeted(&self, ctx: &StepContext, directive: &str) -> bool {
        ctx.param::<String>(directive).as_deref() == Some(self.kind)
    }
}

#[async_trait]
impl StepHandler for HarnessStep {
    async fn perform(&self, ctx: &StepContext) -> Result<StepOutcome, StepError> {
        if self.targeted(ctx, "transientAt") {
            return Err(StepError::Transient(format!("{} asked to stall", self.kind)));
        }
        if self.targeted(ctx, "invalidAt") {
            return Err(StepError::Invalid(format!("{} asked to reject its input", self.kind)));
        }
        if self.targeted(ctx, "failAt") {
            return Ok(StepOutcome::failed_with(format!("{} asked to fail", self.kind)));
        }
        if self.targeted(ctx, "pendingAt") {
            return Ok(StepOutcome::pending(json!({ "waiting": self.kind })));
        }

        if self.kind == S2 && ctx.get("s1Result").is_none() {
            return Err(StepError::Invalid("s1Result missing from input".to_string()));
        }

        let mut response = serde_json::Map::new();
        response.insert(
            format!("{}Result", self.kind),
            json!({ "stepId": ctx.step_id, "echo": ctx.get("echo").cloned().unwrap_or(Value::Null) }),
        );
        response.insert("lastStep".to_string(), json!(self.kind));
        Ok(StepOutcome::done(Value::Object(response)))
    }

    fn max_timeout_retries(&self) -> u32 {
        self.max_timeout_retries
    }
}

/// Bind `s1` and `s2` for the `test` kind
pub fn register(handlers: &mut StepHandlers) {
    handlers
        .register(WorkflowKind::Test, S1, Arc::new(HarnessStep::new(S1)))
        .register(WorkflowKind::Test, S2, Arc::new(HarnessStep::new(S2)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::step::TaskStatus;
    use uuid::Uuid;

    fn context(step_kind: &str, input: Value) -> StepContext {
        StepContext {
            workflow_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
            workflow_kind: WorkflowKind::Test,
            step_kind: step_kind.to_string(),
            client_id: None,
            chain_id: None,
            input,
        }
    }

    #[tokio::test]
    async fn directives_only_hit_the_named_step() {
        let s1 = HarnessStep::new(S1);
        let outcome = s1.perform(&context(S1, json!({"failAt": "s2"}))).await.unwrap();
        assert_eq!(outcome.task_status, TaskStatus::TaskDone);

        let outcome = s1.perform(&context(S1, json!({"failAt": "s1"}))).await.unwrap();
        assert_eq!(outcome.task_status, TaskStatus::TaskFailed);

        let error = s1.perform(&context(S1, json!({"transientAt": "s1"}))).await.unwrap_err();
        assert!(matches!(error, StepError::Transient(_)));
    }

    #[tokio::test]
    async fn s2_requires_s1_result() {
        let s2 = HarnessStep::new(S2);
        let error = s2.perform(&context(S2, json!({}))).await.unwrap_err();
        assert!(matches!(error, StepError::Invalid(_)));

        let outcome = s2
            .perform(&context(S2, json!({"s1Result": {"echo": 1}})))
            .await
            .unwrap();
        assert_eq!(outcome.task_response_data["lastStep"], "s2");
    }

    #[test]
    fn registered_bindings_match_the_test_table() {
        let mut handlers = StepHandlers::new();
        register(&mut handlers);
        let table = crate::workflow::definitions::test::table().unwrap();
        handlers.validate(WorkflowKind::Test, &table).unwrap();
    }
}
