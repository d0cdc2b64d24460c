//! Workflow definitions and per-execution state.
//!
//! A [`Workflow`] is immutable once defined: the constructor validates step
//! id uniqueness, dependency closure and acyclicity, so a stored workflow is
//! always executable. Per-run state lives in an [`ExecutionContext`] whose
//! step records only ever move forward:
//! Pending -> Ready -> Running -> {Succeeded, Failed, Cancelled}.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::types::{duration_ms_opt, AgentKind, ExecutionId, StepId, WorkflowId};

fn default_tokens() -> u32 {
    1
}

/// One unit of work targeting an agent type and action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    /// Worker role the step must run on.
    pub agent_kind: AgentKind,
    /// Message type dispatched to the chosen agent.
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Steps that must succeed before this one becomes ready.
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Maximum wall-clock duration; `None` means the engine default.
    #[serde(default, with = "duration_ms_opt")]
    pub timeout: Option<Duration>,
    /// Resource consulted before dispatch; `None` means the engine default.
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default = "default_tokens")]
    pub tokens: u32,
}

impl WorkflowStep {
    pub fn new(id: impl Into<StepId>, agent_kind: impl Into<AgentKind>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent_kind: agent_kind.into(),
            action: action.into(),
            parameters: HashMap::new(),
            depends_on: Vec::new(),
            timeout: None,
            resource_type: None,
            tokens: default_tokens(),
        }
    }

    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Consume `tokens` of `resource_type` instead of the engine default.
    #[must_use]
    pub fn resource(mut self, resource_type: impl Into<String>, tokens: u32) -> Self {
        self.resource_type = Some(resource_type.into());
        self.tokens = tokens;
        self
    }
}

/// An immutable DAG of steps with globals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub steps: Vec<WorkflowStep>,
    /// Parameters visible to every step.
    #[serde(default)]
    pub globals: HashMap<String, String>,
}

impl Workflow {
    /// Validate and build a workflow.
    ///
    /// Rejects empty step lists, duplicate step ids, dependencies on steps
    /// outside the workflow and dependency cycles.
    pub fn new(
        name: impl Into<String>,
        steps: Vec<WorkflowStep>,
        globals: HashMap<String, String>,
    ) -> Result<Self> {
        let name = name.into();
        if steps.is_empty() {
            return Err(OrchestratorError::InvalidDefinition(format!(
                "workflow {name} has no steps"
            )));
        }

        let mut ids = HashSet::new();
        for step in &steps {
            if !ids.insert(step.id.clone()) {
                return Err(OrchestratorError::InvalidDefinition(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }
        for step in &steps {
            for dep in &step.depends_on {
                if !ids.contains(dep) {
                    return Err(OrchestratorError::InvalidDefinition(format!(
                        "step {} depends on unknown step {dep}",
                        step.id
                    )));
                }
            }
        }

        let workflow = Self {
            id: WorkflowId::generate(),
            name,
            steps,
            globals,
        };
        workflow.check_acyclic()?;
        Ok(workflow)
    }

    /// Depth-first cycle detection over the dependency relation.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&StepId, &WorkflowStep> =
            self.steps.iter().map(|s| (&s.id, s)).collect();
        let mut marks: HashMap<&StepId, Mark> =
            self.steps.iter().map(|s| (&s.id, Mark::Unvisited)).collect();

        fn visit<'a>(
            id: &'a StepId,
            index: &HashMap<&'a StepId, &'a WorkflowStep>,
            marks: &mut HashMap<&'a StepId, Mark>,
        ) -> bool {
            match marks[id] {
                Mark::Done => return true,
                Mark::InProgress => return false,
                Mark::Unvisited => {}
            }
            marks.insert(id, Mark::InProgress);
            for dep in &index[id].depends_on {
                if !visit(dep, index, marks) {
                    return false;
                }
            }
            marks.insert(id, Mark::Done);
            true
        }

        for step in &self.steps {
            if !visit(&step.id, &index, &mut marks) {
                return Err(OrchestratorError::InvalidDefinition(format!(
                    "dependency cycle through step {}",
                    step.id
                )));
            }
        }
        Ok(())
    }

    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == *id)
    }

    /// Steps that list `id` as a dependency.
    pub fn dependents(&self, id: &StepId) -> Vec<&WorkflowStep> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.contains(id))
            .collect()
    }
}

/// Where a step is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Cancelled
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Why a step failed. Recorded alongside the error message so timeouts and
/// cancellations stay distinguishable from handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Timeout,
    Cancelled,
}

/// Per-step record inside an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            failure: None,
        }
    }
}

/// Mutable state of one running workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    /// Seeded from workflow globals and the caller's initial variables;
    /// step outputs merge in under `step_id.`-prefixed keys.
    pub variables: HashMap<String, String>,
    pub steps: HashMap<StepId, StepRecord>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionContext {
    /// Fresh context: every step Pending, dependency-free steps Ready.
    pub fn new(workflow: &Workflow, initial: HashMap<String, String>) -> Self {
        let mut variables = workflow.globals.clone();
        variables.extend(initial);

        let mut steps: HashMap<StepId, StepRecord> = workflow
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepRecord::pending()))
            .collect();
        for step in &workflow.steps {
            if step.depends_on.is_empty() {
                if let Some(record) = steps.get_mut(&step.id) {
                    record.status = StepStatus::Ready;
                }
            }
        }

        Self {
            execution_id: ExecutionId::generate(),
            workflow_id: workflow.id.clone(),
            variables,
            steps,
            cancelled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn record_mut(&mut self, id: &StepId) -> Result<&mut StepRecord> {
        self.steps.get_mut(id).ok_or_else(|| {
            OrchestratorError::unknown(crate::error::EntityKind::Step, id.as_str())
        })
    }

    /// Pending -> Ready, once all dependencies have succeeded.
    pub fn mark_ready(&mut self, id: &StepId) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.status != StepStatus::Pending {
            return Err(OrchestratorError::InternalInvariant(format!(
                "step {id} marked ready from {:?}",
                record.status
            )));
        }
        record.status = StepStatus::Ready;
        Ok(())
    }

    /// Ready -> Running. A step runs at most once.
    pub fn mark_running(&mut self, id: &StepId) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.status != StepStatus::Ready {
            return Err(OrchestratorError::InternalInvariant(format!(
                "step {id} dispatched from {:?}",
                record.status
            )));
        }
        record.status = StepStatus::Running;
        record.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Succeeded, merging outputs into the variable store under
    /// `step_id.`-prefixed keys.
    pub fn complete(&mut self, id: &StepId, output: serde_json::Value) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.status != StepStatus::Running {
            return Err(OrchestratorError::InternalInvariant(format!(
                "step {id} completed from {:?}",
                record.status
            )));
        }
        record.status = StepStatus::Succeeded;
        record.finished_at = Some(Utc::now());
        record.output = Some(output.clone());

        let prefix = id.as_str();
        match output {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    let rendered = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    self.variables.insert(format!("{prefix}.{key}"), rendered);
                }
            }
            serde_json::Value::Null => {}
            other => {
                self.variables
                    .insert(format!("{prefix}.output"), other.to_string());
            }
        }
        Ok(())
    }

    /// Mark a step Failed with the given kind. Legal from Ready (immediate
    /// failures such as an unknown resource) and Running.
    pub fn fail(&mut self, id: &StepId, kind: FailureKind, error: impl Into<String>) -> Result<()> {
        let record = self.record_mut(id)?;
        if record.status.is_terminal() || record.status == StepStatus::Pending {
            return Err(OrchestratorError::InternalInvariant(format!(
                "step {id} failed from {:?}",
                record.status
            )));
        }
        record.status = StepStatus::Failed;
        record.finished_at = Some(Utc::now());
        record.failure = Some(kind);
        record.error = Some(error.into());
        Ok(())
    }

    /// Pending/Ready -> Cancelled. Running steps go through [`Self::fail`]
    /// with [`FailureKind::Cancelled`] instead.
    pub fn cancel_step(&mut self, id: &StepId) -> Result<()> {
        let record = self.record_mut(id)?;
        if !matches!(record.status, StepStatus::Pending | StepStatus::Ready) {
            return Err(OrchestratorError::InternalInvariant(format!(
                "step {id} cancelled from {:?}",
                record.status
            )));
        }
        record.status = StepStatus::Cancelled;
        record.finished_at = Some(Utc::now());
        record.failure = Some(FailureKind::Cancelled);
        Ok(())
    }

    /// Steps currently dispatchable.
    pub fn ready_steps(&self) -> Vec<StepId> {
        let mut ready: Vec<StepId> = self
            .steps
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Ready)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn status_of(&self, id: &StepId) -> Option<StepStatus> {
        self.steps.get(id).map(|r| r.status)
    }

    /// After `succeeded` finishes, promote any dependent whose dependencies
    /// have all succeeded. Returns the newly ready step ids.
    pub fn promote_dependents(&mut self, workflow: &Workflow, succeeded: &StepId) -> Vec<StepId> {
        let mut promoted = Vec::new();
        for dependent in workflow.dependents(succeeded) {
            if self.status_of(&dependent.id) != Some(StepStatus::Pending) {
                continue;
            }
            let unblocked = dependent
                .depends_on
                .iter()
                .all(|dep| self.status_of(dep) == Some(StepStatus::Succeeded));
            if unblocked {
                if self.mark_ready(&dependent.id).is_ok() {
                    promoted.push(dependent.id.clone());
                }
            }
        }
        promoted
    }

    /// True once nothing can make further progress: no step is Ready or
    /// Running. Remaining Pending steps are permanently blocked by a failed
    /// or cancelled dependency and stay Pending in the final record.
    pub fn is_quiescent(&self) -> bool {
        !self
            .steps
            .values()
            .any(|r| matches!(r.status, StepStatus::Ready | StepStatus::Running))
    }

    /// Aggregate status for a finished execution.
    pub fn final_status(&self) -> ExecutionStatus {
        if self.cancelled {
            ExecutionStatus::Cancelled
        } else if self
            .steps
            .values()
            .all(|r| r.status == StepStatus::Succeeded)
        {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        }
    }
}

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Everything a caller gets back once an execution terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub status: ExecutionStatus,
    pub steps: HashMap<StepId, StepRecord>,
    pub variables: HashMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// Build the final result from a quiescent context.
    pub fn from_context(context: &ExecutionContext) -> Self {
        Self {
            execution_id: context.execution_id.clone(),
            workflow_id: context.workflow_id.clone(),
            status: context.final_status(),
            steps: context.steps.clone(),
            variables: context.variables.clone(),
            started_at: context.started_at,
            finished_at: context.finished_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, "parser", "tokenize");
        for dep in deps {
            step = step.depends_on(*dep);
        }
        step
    }

    fn linear_workflow() -> Workflow {
        Workflow::new(
            "linear",
            vec![step("s1", &[]), step("s2", &["s1"])],
            HashMap::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let err = Workflow::new("w", vec![step("s1", &[]), step("s1", &[])], HashMap::new())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDefinition(_)));
    }

    #[test]
    fn test_dangling_dependency_rejected() {
        let err =
            Workflow::new("w", vec![step("s1", &["ghost"])], HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Workflow::new(
            "w",
            vec![step("s1", &["s3"]), step("s2", &["s1"]), step("s3", &["s2"])],
            HashMap::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let err = Workflow::new("w", vec![step("s1", &["s1"])], HashMap::new()).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidDefinition(_)));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        assert!(Workflow::new("w", vec![], HashMap::new()).is_err());
    }

    #[test]
    fn test_diamond_is_valid() {
        let workflow = Workflow::new(
            "diamond",
            vec![
                step("s1", &[]),
                step("s2", &["s1"]),
                step("s3", &["s1"]),
                step("s4", &["s2", "s3"]),
            ],
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(workflow.dependents(&StepId::new("s1")).len(), 2);
    }

    #[test]
    fn test_context_seeds_globals_and_ready_set() {
        let workflow = Workflow::new(
            "w",
            vec![step("s1", &[]), step("s2", &["s1"])],
            HashMap::from([("corpus".to_string(), "abc".to_string())]),
        )
        .unwrap();
        let context = ExecutionContext::new(
            &workflow,
            HashMap::from([("depth".to_string(), "3".to_string())]),
        );

        assert_eq!(context.variables["corpus"], "abc");
        assert_eq!(context.variables["depth"], "3");
        assert_eq!(context.ready_steps(), vec![StepId::new("s1")]);
        assert_eq!(context.status_of(&StepId::new("s2")), Some(StepStatus::Pending));
    }

    #[test]
    fn test_step_walk_and_output_merge() {
        let workflow = linear_workflow();
        let mut context = ExecutionContext::new(&workflow, HashMap::new());
        let s1 = StepId::new("s1");
        let s2 = StepId::new("s2");

        context.mark_running(&s1).unwrap();
        context
            .complete(&s1, serde_json::json!({"tokens": "42", "truncated": false}))
            .unwrap();
        assert_eq!(context.variables["s1.tokens"], "42");
        assert_eq!(context.variables["s1.truncated"], "false");

        let promoted = context.promote_dependents(&workflow, &s1);
        assert_eq!(promoted, vec![s2.clone()]);
        assert_eq!(context.status_of(&s2), Some(StepStatus::Ready));
        assert!(!context.is_quiescent());

        context.mark_running(&s2).unwrap();
        context.complete(&s2, serde_json::Value::Null).unwrap();
        assert!(context.is_quiescent());
        assert_eq!(context.final_status(), ExecutionStatus::Succeeded);
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let workflow = linear_workflow();
        let mut context = ExecutionContext::new(&workflow, HashMap::new());
        let s1 = StepId::new("s1");

        context.mark_running(&s1).unwrap();
        context
            .fail(&s1, FailureKind::Timeout, "deadline exceeded")
            .unwrap();

        assert!(context.complete(&s1, serde_json::Value::Null).is_err());
        assert!(context.fail(&s1, FailureKind::Error, "again").is_err());
        assert_eq!(context.status_of(&s1), Some(StepStatus::Failed));
        assert_eq!(
            context.steps[&s1].failure,
            Some(FailureKind::Timeout)
        );
    }

    #[test]
    fn test_step_dispatched_at_most_once() {
        let workflow = linear_workflow();
        let mut context = ExecutionContext::new(&workflow, HashMap::new());
        let s1 = StepId::new("s1");

        context.mark_running(&s1).unwrap();
        assert!(matches!(
            context.mark_running(&s1),
            Err(OrchestratorError::InternalInvariant(_))
        ));
    }

    #[test]
    fn test_failed_dependency_blocks_dependents() {
        let workflow = linear_workflow();
        let mut context = ExecutionContext::new(&workflow, HashMap::new());
        let s1 = StepId::new("s1");
        let s2 = StepId::new("s2");

        context.mark_running(&s1).unwrap();
        context.fail(&s1, FailureKind::Error, "boom").unwrap();

        assert!(context.promote_dependents(&workflow, &s1).is_empty());
        assert_eq!(context.status_of(&s2), Some(StepStatus::Pending));
        assert!(context.is_quiescent());
        assert_eq!(context.final_status(), ExecutionStatus::Failed);
    }

    #[test]
    fn test_cancel_marks_pending_and_ready() {
        let workflow = linear_workflow();
        let mut context = ExecutionContext::new(&workflow, HashMap::new());
        context.cancelled = true;
        context.cancel_step(&StepId::new("s1")).unwrap();
        context.cancel_step(&StepId::new("s2")).unwrap();

        assert!(context.is_quiescent());
        assert_eq!(context.final_status(), ExecutionStatus::Cancelled);
    }
}
