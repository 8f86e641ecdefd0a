/// StepsConfig registry
///
/// Per workflow kind, an immutable table from step kind to its transitions:
/// `on_success` fan-out, optional `on_failure` edge and the ancestor kinds whose
/// response data feeds the step (`read_data_from`).
///
/// Tables are compiled once at startup. Compilation builds a petgraph DAG of
/// the declared edges and rejects anything that could strand a workflow:
/// unknown kinds, cycles, non-terminal dead ends, kinds unreachable from `init`
/// and data dependencies on steps that can never precede the reader.

use crate::{
    error::{EngineError, Result},
    workflow::types::{is_terminal_kind, StepStatus, WorkflowKind, INIT, MARK_FAILURE, MARK_SUCCESS},
};
use petgraph::{
    algo::{has_path_connecting, toposort},
    graph::{DiGraph, NodeIndex},
    visit::Dfs,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

/// Transition rule for one (workflow kind, step kind)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTransition {
    /// Next kinds on success, each dispatched as its own branch
    pub on_success: Vec<String>,
    /// Next kind on failure/timeout; `markFailure` when absent
    pub on_failure: Option<String>,
    /// Ancestor kinds whose response data is merged into this step's input
    pub read_data_from: Vec<String>,
}

impl StepTransition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.on_success = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn on_failure(mut self, kind: impl Into<String>) -> Self {
        self.on_failure = Some(kind.into());
        self
    }

    pub fn read_data_from<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_data_from = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Successor kinds for a step that ended in `status`
    ///
    /// Exactly one edge set is chosen: success kinds for `processed`, the
    /// failure kind (or `markFailure`) for `failed`/`timeout`, nothing otherwise.
    pub fn successors_for(&self, status: StepStatus) -> Vec<String> {
        match status {
            StepStatus::Processed => self.on_success.clone(),
            StepStatus::Failed | StepStatus::Timeout => vec![self
                .on_failure
                .clone()
                .unwrap_or_else(|| MARK_FAILURE.to_string())],
            StepStatus::Queued | StepStatus::Pending => Vec::new(),
        }
    }
}

/// Compiled steps table of one workflow kind
#[derive(Debug, Clone)]
pub struct StepsConfig {
    kind: WorkflowKind,
    steps: BTreeMap<String, StepTransition>,
}

/// Collects table entries before compilation
#[derive(Debug)]
pub struct StepsConfigBuilder {
    kind: WorkflowKind,
    steps: BTreeMap<String, StepTransition>,
    duplicates: Vec<String>,
}

impl StepsConfig {
    pub fn builder(kind: WorkflowKind) -> StepsConfigBuilder {
        StepsConfigBuilder {
            kind,
            steps: BTreeMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }

    pub fn get(&self, step_kind: &str) -> Option<&StepTransition> {
        self.steps.get(step_kind)
    }

    pub fn contains(&self, step_kind: &str) -> bool {
        self.steps.contains_key(step_kind)
    }

    /// Every step kind of the table, terminals included
    pub fn step_kinds(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

impl StepsConfigBuilder {
    pub fn step(mut self, step_kind: impl Into<String>, transition: StepTransition) -> Self {
        let step_kind = step_kind.into();
        if self.steps.insert(step_kind.clone(), transition).is_some() {
            self.duplicates.push(step_kind);
        }
        self
    }

    /// Validate and freeze the table
    pub fn compile(mut self) -> Result<StepsConfig> {
        let kind = self.kind;
        let fail = |reason: String| {
            Err(EngineError::Configuration(format!(
                "Invalid steps table for {}: {}",
                kind, reason
            )))
        };

        if let Some(step_kind) = self.duplicates.first() {
            return fail(format!("step '{}' declared twice", step_kind));
        }
        if !self.steps.contains_key(INIT) {
            return fail(format!("missing '{}' step", INIT));
        }

        // Terminals are universal and carry no edges
        for terminal in [MARK_SUCCESS, MARK_FAILURE] {
            let transition = self.steps.entry(terminal.to_string()).or_default();
            if !transition.on_success.is_empty()
                || transition.on_failure.is_some()
                || !transition.read_data_from.is_empty()
            {
                return fail(format!("terminal '{}' must not declare edges", terminal));
            }
        }

        // Build the DAG of declared edges
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut index: HashMap<&str, NodeIndex> = HashMap::new();
        for step_kind in self.steps.keys() {
            index.insert(step_kind.as_str(), graph.add_node(step_kind.as_str()));
        }

        for (step_kind, transition) in &self.steps {
            if !is_terminal_kind(step_kind) && transition.on_success.is_empty() {
                return fail(format!("'{}' has no success edge and is not a terminal", step_kind));
            }

            let targets = transition.on_success.iter().chain(transition.on_failure.iter());
            for target in targets {
                let Some(&to) = index.get(target.as_str()) else {
                    return fail(format!("'{}' references unknown step '{}'", step_kind, target));
                };
                if target == INIT {
                    return fail(format!("'{}' routes back into '{}'", step_kind, INIT));
                }
                graph.add_edge(index[step_kind.as_str()], to, ());
            }
        }

        if toposort(&graph, None).is_err() {
            return fail("transitions contain a cycle".to_string());
        }

        // Every non-terminal kind must be reachable from init
        let mut reachable = Vec::new();
        let mut dfs = Dfs::new(&graph, index[INIT]);
        while let Some(node) = dfs.next(&graph) {
            reachable.push(node);
        }
        for (step_kind, node) in &index {
            if !is_terminal_kind(step_kind) && !reachable.contains(node) {
                return fail(format!("'{}' is unreachable from '{}'", step_kind, INIT));
            }
        }

        // Data dependencies must be able to precede the reader
        for (step_kind, transition) in &self.steps {
            for source in &transition.read_data_from {
                let Some(&from) = index.get(source.as_str()) else {
                    return fail(format!("'{}' reads data from unknown step '{}'", step_kind, source));
                };
                if !has_path_connecting(&graph, from, index[step_kind.as_str()], None)
                    || source == step_kind
                {
                    return fail(format!(
                        "'{}' reads data from '{}', which is never its ancestor",
                        step_kind, source
                    ));
                }
            }
        }

        tracing::debug!("✅ Compiled steps table for {} ({} step kinds)", kind, self.steps.len());
        Ok(StepsConfig {
            kind,
            steps: self.steps,
        })
    }
}

/// Registry of compiled steps tables, keyed by workflow kind
#[derive(Debug, Clone, Default)]
pub struct StepsConfigRegistry {
    configs: HashMap<WorkflowKind, Arc<StepsConfig>>,
}

impl StepsConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in table
    ///
    /// Fails if any table does not compile; callers treat that as fatal at startup.
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for config in crate::workflow::definitions::all()? {
            registry.register(config);
        }
        tracing::info!("📊 Loaded {} steps tables", registry.configs.len());
        Ok(registry)
    }

    /// Add or replace the table for its workflow kind
    pub fn register(&mut self, config: StepsConfig) {
        self.configs.insert(config.kind(), Arc::new(config));
    }

    pub fn get(&self, kind: WorkflowKind) -> Option<Arc<StepsConfig>> {
        self.configs.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<WorkflowKind> {
        let mut kinds: Vec<_> = self.configs.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
