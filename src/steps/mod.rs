/// Built-in step implementations
///
/// Chain-facing implementations live with the services that own the chain
/// clients and are registered by the embedding application. The engine ships
/// only the test harness used to exercise routing end to end.

// Configurable s1/s2 steps for the `test` workflow kind
pub mod test_harness;

use crate::{runtime::step::StepHandlers, workflow::types::WorkflowKind};

/// Handlers bundled with the engine for `kinds`
pub fn builtin_handlers(kinds: &[WorkflowKind]) -> StepHandlers {
    let mut handlers = StepHandlers::new();
    if kinds.contains(&WorkflowKind::Test) {
        test_harness::register(&mut handlers);
    }
    handlers
}
